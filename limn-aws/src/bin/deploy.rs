//! One-shot SageMaker deployment for the avatar endpoint.
//!
//! Creates a model from the published server container, an endpoint config
//! with a single GPU variant, and the endpoint itself. Fixed configuration,
//! no flags: edit the constants below before running.

use anyhow::{Context, Result};
use aws_config::BehaviorVersion;
use aws_sdk_sagemaker::types::{
    ContainerDefinition, ProductionVariant, ProductionVariantInstanceType,
};
use tracing::info;

// --- Configuration ---
const ROLE_ARN: &str = "arn:aws:iam::017116124664:role/SageMaker-Avatar-Generator-Role";
const REGION: &str = "us-east-1";
const INSTANCE_TYPE: ProductionVariantInstanceType = ProductionVariantInstanceType::MlG5Xlarge;
const MODEL_NAME: &str = "limn-avatar-generator";
const ENDPOINT_NAME: &str = "limn-avatar-generator-endpoint";
const IMAGE_URI: &str = "017116124664.dkr.ecr.us-east-1.amazonaws.com/limn-server:latest";
// --- End Configuration ---

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt::init();
    if let Err(e) = deploy().await {
        eprintln!("deployment failed: {e:?}");
        eprintln!(
            "check that the IAM role ARN is correct and has SageMaker permissions, \
             and see the endpoint's CloudWatch logs for details"
        );
        std::process::exit(1);
    }
}

async fn deploy() -> Result<()> {
    info!(role = ROLE_ARN, region = REGION, "starting SageMaker deployment");

    let config = aws_config::defaults(BehaviorVersion::latest())
        .region(REGION)
        .load()
        .await;
    let client = aws_sdk_sagemaker::Client::new(&config);

    let container = ContainerDefinition::builder().image(IMAGE_URI).build();
    client
        .create_model()
        .model_name(MODEL_NAME)
        .execution_role_arn(ROLE_ARN)
        .primary_container(container)
        .send()
        .await
        .context("failed to create model")?;
    info!(model = MODEL_NAME, "created model");

    let variant = ProductionVariant::builder()
        .variant_name("AllTraffic")
        .model_name(MODEL_NAME)
        .initial_instance_count(1)
        .instance_type(INSTANCE_TYPE)
        .build();
    let config_name = format!("{ENDPOINT_NAME}-config");
    client
        .create_endpoint_config()
        .endpoint_config_name(&config_name)
        .production_variants(variant)
        .send()
        .await
        .context("failed to create endpoint config")?;
    info!(config = config_name, "created endpoint config");

    client
        .create_endpoint()
        .endpoint_name(ENDPOINT_NAME)
        .endpoint_config_name(&config_name)
        .send()
        .await
        .context("failed to create endpoint")?;

    println!("deployment requested for endpoint '{ENDPOINT_NAME}'");
    println!("the endpoint takes 10-15 minutes to come in service");
    Ok(())
}
