//! s3nbd binary
//!
//! NBD server persisting exports in S3-compatible object storage.

use clap::Parser;
use env_logger::Env;
use std::process;

use s3nbd::config::{parse_size, S3Config, ServerConfig, DEFAULT_HOST, DEFAULT_PORT};
use s3nbd::storage::DEFAULT_LEASE_DURATION;
use s3nbd::NbdServer;

#[derive(Parser, Debug)]
#[command(name = "s3nbd")]
#[command(about = "NBD server backed by S3-compatible object storage", long_about = None)]
struct Args {
    /// Listen address
    #[arg(long, default_value = DEFAULT_HOST)]
    host: String,

    /// Listen port
    #[arg(long, default_value_t = DEFAULT_PORT)]
    port: u16,

    /// Export size in bytes, or with a K/M/G/T suffix
    #[arg(long, default_value = "1G", value_parser = parse_size)]
    export_size: u64,

    /// Block size in bytes, or with a K/M/G/T suffix
    #[arg(long, default_value = "128K", value_parser = parse_size)]
    block_size: u64,

    /// S3 endpoint URL
    #[arg(long, env = "S3_ENDPOINT_URL")]
    endpoint_url: String,

    /// S3 access key
    #[arg(long, env = "S3_ACCESS_KEY")]
    access_key: String,

    /// S3 secret key
    #[arg(long, env = "S3_SECRET_KEY", hide_env_values = true)]
    secret_key: String,

    /// Bucket holding block and lock objects
    #[arg(long, env = "S3_BUCKET")]
    bucket: String,

    /// S3 region
    #[arg(long, env = "S3_REGION", default_value = "us-east-1")]
    region: String,
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    env_logger::Builder::from_env(Env::default().default_filter_or("info")).init();

    let args = Args::parse();

    let config = ServerConfig {
        host: args.host,
        port: args.port,
        export_size: args.export_size,
        block_size: args.block_size,
        lease_duration: DEFAULT_LEASE_DURATION,
        s3: S3Config {
            endpoint_url: args.endpoint_url,
            access_key: args.access_key,
            secret_key: args.secret_key,
            bucket: args.bucket,
            region: args.region,
        },
    };

    if let Err(err) = config.validate() {
        log::error!("Invalid configuration: {}", err);
        process::exit(1);
    }

    log::info!("Starting NBD server");
    log::info!("  Listen: {}:{}", config.host, config.port);
    log::info!("  Export size: {} bytes", config.export_size);
    log::info!("  Block size: {} bytes", config.block_size);
    log::info!("  Endpoint: {}", config.s3.endpoint_url);
    log::info!("  Bucket: {}", config.s3.bucket);

    let server = NbdServer::new(config);
    if let Err(err) = server.run().await {
        log::error!("Server error: {}", err);
        process::exit(1);
    }
}
