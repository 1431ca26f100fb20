use anyhow::Result;

pub fn run() -> Result<i32> {
    println!("tarka {}", env!("CARGO_PKG_VERSION"));
    Ok(crate::cli::EXIT_OK)
}
