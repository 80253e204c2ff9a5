//! Fetches the same URL twice and shows the second answer coming from cache.
//!
//! Starts a throwaway origin on a loopback port so it runs offline:
//!
//! ```sh
//! RUST_LOG=fetch_cache=debug cargo run --example cached_fetch
//! ```

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use fetch_cache::FetchCache;
use fetch_cache::cache::{CacheOkayOnly, MemoryCache};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("fetch_cache=debug")),
        )
        .init();

    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    let hits = Arc::new(AtomicUsize::new(0));

    let origin_hits = Arc::clone(&hits);
    tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            let n = origin_hits.fetch_add(1, Ordering::SeqCst) + 1;
            tokio::spawn(async move {
                let mut buf = [0u8; 4096];
                let _ = socket.read(&mut buf).await;
                let body = format!("{{\"origin_hit\":{n}}}");
                let response = format!(
                    "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: {}\r\n\r\n{}",
                    body.len(),
                    body
                );
                let _ = socket.write_all(response.as_bytes()).await;
            });
        }
    });

    let cache = FetchCache::builder()
        .cache(Arc::new(MemoryCache::new()))
        .should_cache_response(CacheOkayOnly)
        .build();
    let url = format!("http://{addr}/json");

    for attempt in 1..=2 {
        let mut response = cache.fetch(url.as_str(), None).await?;
        println!(
            "attempt {attempt}: status={} from_cache={} body={}",
            response.status(),
            response.returned_from_cache(),
            response.text().await?
        );
        for (name, value) in response.headers().entries() {
            println!("  {name}: {value}");
        }
    }
    println!("origin was hit {} time(s)", hits.load(Ordering::SeqCst));

    Ok(())
}
