//! A test driver sharing one device across a handful of "tests".
//!
//! Run with `RUST_LOG=debug` to see the pool's decisions.

use device_pool::testing::FakeGpu;
use device_pool::{DevicePool, Error, ErrorFilter, PoolConfig};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Clone, Copy)]
enum Scenario {
    Passes,
    MisusesApi,
    RunsOutOfMemory,
    CrashesGpu,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<(), Error> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let pool = DevicePool::new(FakeGpu::new(), PoolConfig::default())?;
    let scenarios = [
        Scenario::Passes,
        Scenario::MisusesApi,
        Scenario::Passes,
        Scenario::RunsOutOfMemory,
        Scenario::Passes,
        Scenario::CrashesGpu,
        Scenario::Passes,
    ];

    for (index, scenario) in scenarios.into_iter().enumerate() {
        let device = pool.acquire().await?;
        match scenario {
            Scenario::Passes => {}
            Scenario::MisusesApi => device.raise(ErrorFilter::Validation, "invalid bind group"),
            Scenario::RunsOutOfMemory => device.raise(ErrorFilter::OutOfMemory, "buffer too large"),
            Scenario::CrashesGpu => device.lose("gpu process crashed"),
        }
        let generation = device.generation();

        match pool.release(device).await {
            Ok(()) => println!("test {index} ({scenario:?}) passed on device #{generation}"),
            Err(err) if err.should_attempt_gc() => {
                println!("test {index} ({scenario:?}) failed: {err}; reclaiming memory");
            }
            Err(err) => println!("test {index} ({scenario:?}) failed: {err}"),
        }
    }

    println!("{:#?}", pool.stats());
    Ok(())
}
