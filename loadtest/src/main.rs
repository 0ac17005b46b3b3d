use goose::prelude::*;
use rand::Rng;

/// Load testing suite for the image cache proxy.
///
/// Simulates the traffic mix a cache-aside proxy sees in production:
/// - Repeated requests for a small set of images (cache hits after warmup)
/// - Requests with unique sizing parameters (cache misses, upstream fetch)
/// - Parameter reordering and tracking junk (must share cache entries)
/// - Requests outside the path allowlist (rejected before any work)
///
/// # Usage
/// ```bash
/// cd loadtest
/// cargo run --release -- --host http://localhost:8080 --users 10 --hatch-rate 2 --run-time 60s
/// ```
///
/// The upstream origin must serve images under `/assets/`.
///
/// # Performance Targets
/// - Cache hits: <10ms p95 latency
/// - Cache misses: dominated by upstream latency
/// - Forbidden paths: <2ms p95 latency
/// - Error rate: <1%
#[tokio::main]
async fn main() -> Result<(), GooseError> {
    GooseAttack::initialize()?
        .register_scenario(
            scenario!("CachePerformance")
                // Fixed parameters hit the cache once warm
                .register_transaction(transaction!(cached_image).set_weight(15)?)
                // Same entry reached with shuffled and junk parameters
                .register_transaction(transaction!(reordered_image).set_weight(5)?)
        )
        .register_scenario(
            scenario!("UpstreamFetch")
                // Unique parameters force a miss and a write-back
                .register_transaction(transaction!(uncached_image).set_weight(5)?)
                // Random widths spread load over many keys
                .register_transaction(transaction!(random_size_image).set_weight(10)?)
        )
        .register_scenario(
            scenario!("Admission")
                .register_transaction(transaction!(forbidden_path).set_weight(1)?)
        )
        .execute()
        .await?;

    Ok(())
}

/// Requests one image with fixed parameters.
///
/// After the first write-back every request should be served from the
/// object store without reaching the upstream.
async fn cached_image(user: &mut GooseUser) -> TransactionResult {
    let _goose = user.get("/assets/sample.jpg?w=500&h=500&q=80").await?;
    Ok(())
}

/// Requests the same image as [`cached_image`] with parameters reordered and
/// unrecognized ones added, which must map to the same cache key.
async fn reordered_image(user: &mut GooseUser) -> TransactionResult {
    let _goose = user
        .get("/assets/sample.jpg?utm_source=loadtest&q=80&h=500&w=500")
        .await?;
    Ok(())
}

/// Requests an image with timestamp-derived dimensions so the key is new.
async fn uncached_image(user: &mut GooseUser) -> TransactionResult {
    let timestamp = chrono::Utc::now().timestamp();
    let width = 200 + (timestamp % 100) as i32;
    let height = 200 + ((timestamp / 100) % 100) as i32;

    let url = format!("/assets/sample.jpg?w={}&h={}&q=80", width, height);
    let _goose = user.get(&url).await?;
    Ok(())
}

/// Requests an image with a random width and format.
async fn random_size_image(user: &mut GooseUser) -> TransactionResult {
    // Generate random parameters before await to satisfy Send bounds
    let url = {
        let mut rng = rand::thread_rng();
        let width = rng.gen_range(100..1000);
        let formats = ["webp", "jpeg", "avif"];
        let format = formats[rng.gen_range(0..formats.len())];
        format!("/assets/sample.jpg?w={}&f={}", width, format)
    };

    let _goose = user.get(&url).await?;
    Ok(())
}

/// Requests a path outside the allowlist; expects 403 without upstream work.
async fn forbidden_path(user: &mut GooseUser) -> TransactionResult {
    let request_builder = user.get_request_builder(&GooseMethod::Get, "/private/data")?;
    let goose_request = GooseRequest::builder()
        .set_request_builder(request_builder)
        .expect_status_code(403)
        .build();
    let _goose = user.request(goose_request).await?;
    Ok(())
}
