//! Invokes the deployed avatar endpoint with a local image.
//!
//! Reads the input file, posts its raw bytes to the endpoint, and writes
//! the returned PNG next to it. Fixed configuration, no flags: edit the
//! constants below before running.

use anyhow::{Context, Result};
use aws_config::BehaviorVersion;
use aws_sdk_sagemakerruntime::primitives::Blob;
use std::path::Path;

// --- Configuration ---
const ENDPOINT_NAME: &str = "limn-avatar-generator-endpoint";
const REGION: &str = "us-east-1";
const INPUT_PATH: &str = "user_image.png";
const OUTPUT_PATH: &str = "generated_avatar.png";
// --- End Configuration ---

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt::init();
    if let Err(e) = invoke().await {
        eprintln!("invocation failed: {e:?}");
        std::process::exit(1);
    }
}

async fn invoke() -> Result<()> {
    let payload = std::fs::read(INPUT_PATH)
        .with_context(|| format!("cannot find the input file '{INPUT_PATH}'"))?;
    let content_type = match Path::new(INPUT_PATH).extension().and_then(|e| e.to_str()) {
        Some("jpg") | Some("jpeg") => "image/jpeg",
        _ => "image/png",
    };

    println!("sending '{INPUT_PATH}' to endpoint '{ENDPOINT_NAME}'...");

    let config = aws_config::defaults(BehaviorVersion::latest())
        .region(REGION)
        .load()
        .await;
    let client = aws_sdk_sagemakerruntime::Client::new(&config);

    let response = client
        .invoke_endpoint()
        .endpoint_name(ENDPOINT_NAME)
        .content_type(content_type)
        .body(Blob::new(payload))
        .send()
        .await
        .context("endpoint invocation failed, check the endpoint's CloudWatch logs")?;

    let avatar = response
        .body()
        .context("endpoint returned an empty body")?;
    std::fs::write(OUTPUT_PATH, avatar.as_ref())
        .with_context(|| format!("failed to write '{OUTPUT_PATH}'"))?;

    println!("avatar saved as '{OUTPUT_PATH}'");
    Ok(())
}
