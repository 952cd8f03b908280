#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

use anyhow::Result;
use tarbac_runtime::Args;

#[tokio::main]
async fn main() -> Result<()> {
    Args::parse_and_run().await
}
