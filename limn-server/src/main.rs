use anyhow::{Context, Result};
use axum::{
    body::Bytes,
    extract::{Query, State},
    http::{header, StatusCode},
    response::IntoResponse,
    routing::{get, post},
    Router,
};
use clap::Parser;
use hf_hub::api::tokio::Api;
use image::DynamicImage;
use limn_core::{
    CannyDetector, DeviceMap, GenerationParams, Loader, ModelLike, SdControlNetLoader,
};
use std::{io::Cursor, sync::Arc, time::Instant};
use tokio::net::TcpListener;
use tracing::{error, info};

// Define command line arguments
#[derive(Parser, Debug)]
#[command(author, version, about = "Limn avatar generation server")]
struct Args {
    /// Use CPU instead of GPU
    #[arg(long)]
    cpu: bool,

    /// Host address to bind the server to
    #[arg(long, default_value = "0.0.0.0")]
    host: String,

    /// Port to bind the server to
    #[arg(long, default_value_t = 8080)]
    port: u16,
}

// Application state containing the preloaded pipeline and the edge detector.
struct AppState {
    model: Arc<dyn ModelLike>,
    canny: CannyDetector,
}

/// Liveness probe used by the hosting platform.
async fn ping_handler() -> StatusCode {
    StatusCode::OK
}

async fn invocations_handler(
    State(state): State<Arc<AppState>>,
    Query(params): Query<GenerationParams>,
    body: Bytes,
) -> impl IntoResponse {
    let started = Instant::now();
    match generate_avatar(state, params, body).await {
        Ok(png) => {
            info!(elapsed = ?started.elapsed(), "generated avatar");
            ([(header::CONTENT_TYPE, "image/png")], png).into_response()
        }
        Err(e) => {
            error!("error generating avatar: {e:?}");
            (StatusCode::INTERNAL_SERVER_ERROR, format!("Error: {e:?}")).into_response()
        }
    }
}

/// Decodes the uploaded bytes, derives the edge map, and runs the pipeline
/// on a blocking worker since generation fully occupies the accelerator.
async fn generate_avatar(
    state: Arc<AppState>,
    params: GenerationParams,
    body: Bytes,
) -> Result<Vec<u8>> {
    let input = image::load_from_memory(&body).context("failed to decode input image")?;
    let edges = state.canny.detect(&input);
    let image = tokio::task::spawn_blocking(move || state.model.run(&edges, &params)).await??;
    encode_png(&image)
}

/// Encodes a generated image as PNG bytes.
fn encode_png(img: &DynamicImage) -> Result<Vec<u8>> {
    let mut bytes = Vec::new();
    img.write_to(&mut Cursor::new(&mut bytes), image::ImageFormat::Png)?;
    Ok(bytes)
}

fn app(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/ping", get(ping_handler))
        .route("/invocations", post(invocations_handler))
        .with_state(state)
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();
    let args = Args::parse();

    // --- Load the pipeline once at startup; any failure aborts here ---
    info!("loading pipeline, weights are fetched on first start");
    let model = SdControlNetLoader::load(Api::new()?, DeviceMap::from_cpu_flag(args.cpu)).await?;

    let state = Arc::new(AppState {
        model: Arc::new(model),
        canny: CannyDetector::default(),
    });

    // --- Start the server ---
    let bind_address = format!("{}:{}", args.host, args.port);
    let listener = TcpListener::bind(&bind_address).await?;
    info!("started server on {}", listener.local_addr()?);
    axum::serve(listener, app(state).into_make_service()).await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    /// Stub pipeline returning a solid image without touching any weights.
    struct StubModel;

    impl ModelLike for StubModel {
        fn run(
            &self,
            control_image: &DynamicImage,
            _params: &GenerationParams,
        ) -> anyhow::Result<DynamicImage> {
            let (w, h) = (control_image.width(), control_image.height());
            Ok(DynamicImage::ImageRgb8(image::RgbImage::from_pixel(
                w,
                h,
                image::Rgb([127, 127, 127]),
            )))
        }
    }

    fn test_app() -> Router {
        app(Arc::new(AppState {
            model: Arc::new(StubModel),
            canny: CannyDetector::default(),
        }))
    }

    fn png_fixture() -> Vec<u8> {
        let img = DynamicImage::ImageRgb8(image::RgbImage::from_fn(64, 64, |x, y| {
            if (x / 8 + y / 8) % 2 == 0 {
                image::Rgb([255, 255, 255])
            } else {
                image::Rgb([0, 0, 0])
            }
        }));
        encode_png(&img).unwrap()
    }

    #[tokio::test]
    async fn ping_returns_ok() {
        let response = test_app()
            .oneshot(Request::builder().uri("/ping").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn invocations_returns_png() {
        let request = Request::builder()
            .method("POST")
            .uri("/invocations")
            .header(header::CONTENT_TYPE, "image/png")
            .body(Body::from(png_fixture()))
            .unwrap();
        let response = test_app().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[header::CONTENT_TYPE], "image/png");
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let decoded = image::load_from_memory(&body).unwrap();
        assert!(decoded.width() > 0 && decoded.height() > 0);
    }

    #[tokio::test]
    async fn invocations_rejects_garbage() {
        let request = Request::builder()
            .method("POST")
            .uri("/invocations")
            .body(Body::from(vec![0u8; 32]))
            .unwrap();
        let response = test_app().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        assert!(!body.is_empty(), "error responses carry the error text");
    }

    #[tokio::test]
    async fn invocations_accept_query_overrides() {
        let request = Request::builder()
            .method("POST")
            .uri("/invocations?prompt=watercolor%20portrait&seed=7&steps=4")
            .body(Body::from(png_fixture()))
            .unwrap();
        let response = test_app().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }
}
