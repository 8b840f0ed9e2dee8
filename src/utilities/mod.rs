use rayon::ThreadPoolBuildError;
use time::{DateTime,Local};
use std::{time::Instant, collections::HashMap, ops::Range};
enum DebugTiming {
   Yes,
   Not,
}
const DEBUG_PRINT: DebugTiming = DebugTiming::Not;

pub struct TimeRecords {
    items: HashMap<String, (Instant,f64,bool,String)>
}

impl TimeRecords {
    pub fn new() -> TimeRecords {
        TimeRecords{
            items: HashMap::new()
        }
    }

    pub fn new_item(&mut self, name: &str, comment: &str) {
        if let Some(_) = self.items.get_mut(name) {
            println!("WARNING: the time record for {} has been initialized previously.", name);
        } else {
            let item = (Instant::now(),0.0,false, comment.to_string());
            self.items.insert(name.to_string(),item);
        }
    }

    pub fn count_start(&mut self, name: &str) {
        if let Some(item) = self.items.get_mut(name) {
            if ! item.2 {
                item.0 = Instant::now();
                item.2 = true;
            } else {
                println!("WARNING: the time record for {} has been turned on previously.", name);
            }
        } else {
            self.new_item(name, "");
            println!("WARNING: the time record for {} has not been initialized.", name);
        }
    }

    pub fn count(&mut self, name: &str) {
        if let Some(item) = self.items.get_mut(name) {
            if item.2 {
                item.1 += item.0.elapsed().as_secs_f64();
                item.2 = false;
            } else {
                println!("WARNING: the time record for {} has been turned off previously.", name);
            }
        } else {
            println!("WARNING: the time record for {} has not been initialized.", name);
        }
    }

    pub fn report(&self,name: &str) {
        if let Some(item) = self.items.get(name) {
            let sp = format!("{:20} {:8.3} s for {}", &name, item.1, item.3);
            println!("{}",sp);
        } else {
            println!("WARNING: the time record for {} has not been initialized.", name);
        }
    }

    pub fn report_all(&self) {
        println!("Detailed time report:");
        self.items.iter().for_each(|(name, item)| {
            println!("{:10}|: {:8.3} s for {}", &name, item.1, item.3);
        });
    }
}

/// Cumulative wall-clock counter for a single operation kind on a stored tensor
/// (generation, by-q reads, by-pair reads).
#[derive(Clone,Copy,Debug,Default)]
pub struct CumulTimer {
    pub secs: f64,
    pub calls: usize,
}

impl CumulTimer {
    pub fn new() -> CumulTimer {
        CumulTimer { secs: 0.0, calls: 0 }
    }
    pub fn add(&mut self, start: Instant) {
        self.secs += start.elapsed().as_secs_f64();
        self.calls += 1;
    }
    pub fn reset(&mut self) {
        self.secs = 0.0;
        self.calls = 0;
    }
}

pub fn init_timing() -> DateTime<Local> {
    time::Local::now()
}

pub fn timing(dt0: &DateTime<Local>, iprint: Option<&str>) -> DateTime<Local> {
    let dt1 = time::Local::now();
    match DEBUG_PRINT {
        DebugTiming::Yes => {
            match iprint {
                None => {dt1},
                Some(header) => {
                    let timecost1 = (dt1.timestamp_millis()-dt0.timestamp_millis()) as f64 /1000.0;
                    println!("{:30} cost {:6.2} seconds", header, timecost1);
                    dt1
                }
            }
        },
        DebugTiming::Not => dt1
    }
}

//#[link(name="openblas")]
extern "C" {
    pub fn openblas_get_num_threads() -> ::std::os::raw::c_int;
    pub fn openblas_set_num_threads(n: ::std::os::raw::c_int);
    pub fn goto_get_num_threads() -> ::std::os::raw::c_int;
    pub fn goto_set_num_threads(n: ::std::os::raw::c_int);
}

pub fn omp_get_num_threads_wrapper() -> usize {
    let num_threads_openblas = unsafe{openblas_get_num_threads()} as usize;
    num_threads_openblas
}
/// NOTE: the current OpenBLAS only supports at most 32 threads. Otherwise, it panics with an error:
/// "BLAS : Program is Terminated. Because you tried to allocate too many memory regions."
pub fn omp_set_num_threads_wrapper(n:usize)  {
    unsafe{
        openblas_set_num_threads(n as std::os::raw::c_int);
        goto_set_num_threads(n as std::os::raw::c_int);
    }
}

pub fn balancing(num_tasks:usize, num_threads: usize) -> Vec<Range<usize>> {
    let mut distribute_vec: Vec<Range<usize>> = vec![0..num_tasks;num_threads];
    let chunk_size = num_tasks/num_threads;
    let chunk_rest = num_tasks%num_threads;

    let mut start = 0_usize;
    let mut count = chunk_rest as i32;
    distribute_vec.iter_mut().enumerate().for_each(|(i,data)| {
        if count >0 {
            *data = start..start + chunk_size+1;
            start += chunk_size+1;
            count -= 1;
        } else {
            *data = start..start + chunk_size;
            start += chunk_size;
        }
    });

    distribute_vec
}

pub fn create_pool(num_threads: usize) -> Result<rayon::ThreadPool,ThreadPoolBuildError > {
    match rayon::ThreadPoolBuilder::new()
       .num_threads(num_threads)
       .build()
    {
       Err(e) => Err(e),
       Ok(pool) => Ok(pool),
    }
 }

#[test]
fn test_balancing() {
    let chunks = balancing(10, 3);
    assert_eq!(chunks, vec![0..4, 4..7, 7..10]);
    let total: usize = chunks.iter().map(|r| r.len()).sum();
    assert_eq!(total, 10);

    let chunks = balancing(4, 8);
    assert_eq!(chunks.iter().map(|r| r.len()).sum::<usize>(), 4);
}
