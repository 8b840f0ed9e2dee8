extern crate dunce;
use std::env;

fn main() {
    let blas_dir = if let Ok(blas_dir) = env::var("DFQ_BLAS_DIR") {
        blas_dir
    } else {"".to_string()};

    println!("cargo:rustc-link-lib=openblas");

    if !blas_dir.is_empty() {
        let path = dunce::canonicalize(blas_dir).unwrap();
        println!("cargo:rustc-link-search=native={}",env::join_paths(&[path]).unwrap().to_str().unwrap());
    }
}
