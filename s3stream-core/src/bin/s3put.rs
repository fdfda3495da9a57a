//! Stream a file or stdin into an S3 object
//!
//! Usage: `s3put <key> [file]`. Reads stdin when no file is given.

use s3stream_core::metrics::gather_metrics;
use s3stream_core::storage::{FileBufferPool, PoolConfig, S3Client, S3Config, S3FileSystem, WriterConfig};
use s3stream_core::runtime::{ExecutorConfig, UploadExecutor};
use s3stream_core::DEFAULT_WRITE_BUFFER_SIZE;
use std::sync::Arc;
use std::time::Instant;
use tokio::io::{AsyncRead, AsyncReadExt};
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

const READ_CHUNK: usize = 1024 * 1024;

fn env_or<T: std::str::FromStr>(name: &str, default: T) -> Result<T, Box<dyn std::error::Error>> {
    match std::env::var(name) {
        Ok(value) => value
            .parse()
            .map_err(|_| format!("{} is not a valid value: {}", name, value).into()),
        Err(_) => Ok(default),
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let mut args = std::env::args().skip(1);
    let Some(key) = args.next() else {
        eprintln!("usage: s3put <key> [file]");
        std::process::exit(2);
    };
    let source = args.next();

    // Load configuration
    let s3_config = S3Config {
        endpoint: std::env::var("S3_ENDPOINT").unwrap_or_else(|_| "http://localhost:9000".into()),
        bucket: std::env::var("S3_BUCKET").unwrap_or_else(|_| "s3stream".into()),
        region: std::env::var("S3_REGION").unwrap_or_else(|_| "us-east-1".into()),
        access_key_id: std::env::var("AWS_ACCESS_KEY_ID").ok(),
        secret_access_key: std::env::var("AWS_SECRET_ACCESS_KEY").ok(),
        session_token: std::env::var("AWS_SESSION_TOKEN").ok(),
        ..Default::default()
    };
    let pool_config = PoolConfig {
        buffer_size: env_or("S3_WRITE_BUFFER_SIZE", DEFAULT_WRITE_BUFFER_SIZE)?,
        max_buffers: env_or("S3_MAX_BUFFERS", PoolConfig::default().max_buffers)?,
    };
    let executor_config = ExecutorConfig {
        workers: env_or("S3_UPLOAD_WORKERS", ExecutorConfig::default().workers)?,
        ..Default::default()
    };

    info!(
        "Streaming {} to {}/{} at {} ({} x {} byte buffers, {} workers)",
        source.as_deref().unwrap_or("stdin"),
        s3_config.bucket,
        key,
        s3_config.endpoint,
        pool_config.max_buffers,
        pool_config.buffer_size,
        executor_config.workers
    );

    let endpoint = s3_config.endpoint.clone();
    let bucket = s3_config.bucket.clone();
    let client = Arc::new(S3Client::new(s3_config)?);
    let pool = FileBufferPool::new(pool_config)?;
    let executor = UploadExecutor::new(executor_config)?;
    let fs = S3FileSystem::new(client, endpoint, bucket, pool, executor, WriterConfig::default())?;

    let mut input: Box<dyn AsyncRead + Unpin + Send> = match &source {
        Some(path) => Box::new(tokio::fs::File::open(path).await?),
        None => Box::new(tokio::io::stdin()),
    };

    let mut writer = fs.create_file(&key);
    let start = Instant::now();
    let mut chunk = vec![0u8; READ_CHUNK];

    let copied = async {
        loop {
            let n = input.read(&mut chunk).await.map_err(|e| {
                Box::<dyn std::error::Error>::from(format!("read failed: {}", e))
            })?;
            if n == 0 {
                break;
            }
            writer.append(&chunk[..n]).await?;
        }
        writer.close().await?;
        Ok::<(), Box<dyn std::error::Error>>(())
    };

    let result = tokio::select! {
        result = copied => result,
        _ = tokio::signal::ctrl_c() => {
            warn!("Interrupted, aborting upload");
            Err("interrupted".into())
        }
    };

    if let Err(e) = result {
        error!("Upload of {} failed: {}", writer.path(), e);
        if let Err(abort_err) = writer.abort().await {
            error!("Abort failed: {}", abort_err);
        }
        return Err(e);
    }

    info!(
        "Uploaded {} bytes to {} in {:.2}s",
        writer.bytes_appended(),
        writer.path(),
        start.elapsed().as_secs_f64()
    );
    debug!("Metrics:\n{}", gather_metrics());
    Ok(())
}
