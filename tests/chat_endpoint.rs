use std::io::Cursor;
use std::net::SocketAddr;
use std::sync::Arc;

use hed_edge_server::{
    AppState, CropLayer, CustomLayer, EdgeDetector, EdgeNetwork, ModelError, PreprocessorConfig,
    ServerConfig, TensorShape, create_router,
};
use image::{ImageFormat, Rgb, RgbImage};
use ndarray::{Array4, Axis, s};
use reqwest::multipart::{Form, Part};

/// Stands in for the HED graph: produces an oversized side output whose
/// border is saturated, then aligns it back onto the input with the crop
/// layer the way the real network's `Crop` nodes do.
struct SideOutputNetwork;

impl EdgeNetwork for SideOutputNetwork {
    fn forward(&self, blob: Array4<f32>) -> Result<Array4<f32>, ModelError> {
        let (_, _, height, width) = blob.dim();
        let interior = blob
            .mean_axis(Axis(1))
            .unwrap()
            .mapv(|v| (v / 255.0 + 0.5).clamp(0.0, 1.0));

        let mut side = Array4::<f32>::ones((1, 1, height + 5, width + 5));
        side.slice_mut(s![0, 0, 2..height + 2, 2..width + 2])
            .assign(&interior.index_axis(Axis(0), 0));

        let mut crop = CropLayer::new();
        let shapes = crop
            .memory_shapes(&[TensorShape::of(&side.view()), TensorShape::of(&blob.view())])
            .map_err(|e| ModelError::OutputFormatUnexpected(e.to_string()))?;
        assert_eq!(shapes[0], TensorShape::new(1, 1, height, width));

        crop.forward(&[side.view(), blob.view()])
            .map(|mut outputs| outputs.remove(0))
            .map_err(|e| ModelError::OutputFormatUnexpected(e.to_string()))
    }
}

fn detector() -> EdgeDetector {
    EdgeDetector::new(Arc::new(SideOutputNetwork), PreprocessorConfig::default())
}

/// Fails every forward pass with an error carrying internal details.
struct FailingNetwork;

impl EdgeNetwork for FailingNetwork {
    fn forward(&self, _: Array4<f32>) -> Result<Array4<f32>, ModelError> {
        Err(ModelError::OutputFormatUnexpected(
            "node side_output_3 produced nothing".to_string(),
        ))
    }
}

async fn spawn_server() -> SocketAddr {
    spawn_server_with(detector(), ServerConfig::default()).await
}

async fn spawn_server_with(detector: EdgeDetector, config: ServerConfig) -> SocketAddr {
    let app = create_router(AppState::new(detector), &config);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

fn encode(image: &RgbImage, format: ImageFormat) -> Vec<u8> {
    let mut buffer = Cursor::new(Vec::new());
    image.write_to(&mut buffer, format).unwrap();
    buffer.into_inner()
}

/// Dark square on a white background.
fn square_jpeg(size: u32) -> Vec<u8> {
    let quarter = size / 4;
    let image = RgbImage::from_fn(size, size, |x, y| {
        if (quarter..size - quarter).contains(&x) && (quarter..size - quarter).contains(&y) {
            Rgb([30, 30, 30])
        } else {
            Rgb([250, 250, 250])
        }
    });
    encode(&image, ImageFormat::Jpeg)
}

fn chat_form(prompt: &str, image: Vec<u8>, file_name: &str) -> Form {
    Form::new()
        .text("prompt", prompt.to_string())
        .part("image", Part::bytes(image).file_name(file_name.to_string()))
}

async fn post_chat(addr: SocketAddr, form: Form) -> reqwest::Response {
    reqwest::Client::new()
        .post(format!("http://{addr}/chat"))
        .multipart(form)
        .send()
        .await
        .unwrap()
}

#[tokio::test]
async fn jpeg_upload_returns_same_size_gray_png() {
    let addr = spawn_server().await;

    let response = post_chat(addr, chat_form("find the edges", square_jpeg(256), "square.jpg")).await;
    assert_eq!(response.status(), 200);
    assert_eq!(response.headers()["content-type"], "image/png");

    let body = response.bytes().await.unwrap();
    assert_eq!(image::guess_format(&body).unwrap(), ImageFormat::Png);
    let edges = image::load_from_memory(&body).unwrap();
    assert_eq!(edges.color(), image::ColorType::L8);
    assert_eq!((edges.width(), edges.height()), (256, 256));
}

#[tokio::test]
async fn crop_alignment_leaves_no_border() {
    let addr = spawn_server().await;
    let uniform = encode(&RgbImage::from_pixel(31, 17, Rgb([255, 255, 255])), ImageFormat::Png);

    let response = post_chat(addr, chat_form("", uniform, "white.png")).await;
    assert_eq!(response.status(), 200);

    let edges = image::load_from_memory(&response.bytes().await.unwrap())
        .unwrap()
        .to_luma8();
    assert_eq!(edges.dimensions(), (31, 17));
    let first = edges.get_pixel(0, 0)[0];
    assert_ne!(first, 255);
    assert!(edges.pixels().all(|p| p[0] == first));
}

#[tokio::test]
async fn plain_text_upload_is_a_client_error() {
    let addr = spawn_server().await;

    let response = post_chat(
        addr,
        chat_form("edges", b"hello, I am definitely not a picture".to_vec(), "notes.txt"),
    )
    .await;
    assert_eq!(response.status(), 400);

    let body: serde_json::Value = response.json().await.unwrap();
    assert!(
        body["detail"]
            .as_str()
            .unwrap()
            .contains("Could not decode the image")
    );
}

#[tokio::test]
async fn missing_fields_are_rejected() {
    let addr = spawn_server().await;

    let no_image = Form::new().text("prompt", "edges");
    assert_eq!(post_chat(addr, no_image).await.status(), 422);

    let no_prompt = Form::new().part("image", Part::bytes(square_jpeg(16)).file_name("a.jpg"));
    assert_eq!(post_chat(addr, no_prompt).await.status(), 422);
}

#[tokio::test]
async fn concurrent_requests_get_their_own_edges() {
    let addr = spawn_server().await;
    let reference = detector();

    let inputs: Vec<Vec<u8>> = vec![
        square_jpeg(64),
        encode(&RgbImage::from_pixel(40, 24, Rgb([0, 90, 200])), ImageFormat::Png),
        encode(
            &RgbImage::from_fn(48, 48, |x, _| Rgb([(x * 5) as u8, 10, 10])),
            ImageFormat::Png,
        ),
        square_jpeg(96),
    ];

    let requests = inputs.iter().cloned().enumerate().map(move |(i, bytes)| async move {
        let response = post_chat(addr, chat_form("edges", bytes, &format!("{i}.img"))).await;
        assert_eq!(response.status(), 200);
        response.bytes().await.unwrap().to_vec()
    });
    let handles: Vec<_> = requests.map(tokio::spawn).collect();

    for (handle, input) in handles.into_iter().zip(&inputs) {
        let served = handle.await.unwrap();
        let expected = reference.detect("edges", input).unwrap();
        assert_eq!(served, expected);
    }
}

#[tokio::test]
async fn liveness_and_item_probes() {
    let addr = spawn_server().await;
    let client = reqwest::Client::new();

    let root: serde_json::Value = client
        .get(format!("http://{addr}/"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(root, serde_json::json!({ "Hello": "World" }));

    let item: serde_json::Value = client
        .get(format!("http://{addr}/items/42?q=edges"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(item, serde_json::json!({ "item_id": 42, "q": "edges" }));

    let item: serde_json::Value = client
        .get(format!("http://{addr}/items/7"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(item, serde_json::json!({ "item_id": 7, "q": null }));

    let bad = client
        .get(format!("http://{addr}/items/seven"))
        .send()
        .await
        .unwrap();
    assert_eq!(bad.status(), 400);
}

#[tokio::test]
async fn cors_allows_local_dev_origins_only() {
    let addr = spawn_server().await;
    let client = reqwest::Client::new();

    let preflight = client
        .request(reqwest::Method::OPTIONS, format!("http://{addr}/chat"))
        .header("Origin", "http://localhost:5173")
        .header("Access-Control-Request-Method", "POST")
        .header("Access-Control-Request-Headers", "content-type")
        .send()
        .await
        .unwrap();
    let headers = preflight.headers();
    assert_eq!(
        headers["access-control-allow-origin"],
        "http://localhost:5173"
    );
    assert_eq!(headers["access-control-allow-credentials"], "true");
    assert_eq!(headers["access-control-allow-methods"], "POST");

    let foreign = client
        .get(format!("http://{addr}/"))
        .header("Origin", "http://evil.example")
        .send()
        .await
        .unwrap();
    assert!(foreign.headers().get("access-control-allow-origin").is_none());
}

#[tokio::test]
async fn server_errors_are_redacted_in_production() {
    let failing = || EdgeDetector::new(Arc::new(FailingNetwork), PreprocessorConfig::default());

    let production = ServerConfig {
        environment: "Production".to_string(),
        ..ServerConfig::default()
    };
    let addr = spawn_server_with(failing(), production).await;
    let response = post_chat(addr, chat_form("edges", square_jpeg(32), "a.jpg")).await;
    assert_eq!(response.status(), 500);
    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["detail"], "An internal error occurred");

    // Client errors keep their detail.
    let response = post_chat(addr, chat_form("edges", b"plain text".to_vec(), "a.txt")).await;
    assert_eq!(response.status(), 400);
    let body: serde_json::Value = response.json().await.unwrap();
    assert!(body["detail"].as_str().unwrap().contains("Could not decode the image"));

    let addr = spawn_server_with(failing(), ServerConfig::default()).await;
    let response = post_chat(addr, chat_form("edges", square_jpeg(32), "a.jpg")).await;
    assert_eq!(response.status(), 500);
    let body: serde_json::Value = response.json().await.unwrap();
    assert!(body["detail"].as_str().unwrap().contains("side_output_3"));
}
