//! Delta streaming example.
//!
//! This program fetches the latest cursor, opens a delta stream filtered to
//! message and thread objects, and prints each delta as it arrives. The
//! stream reconnects on its own; the example exits once retries are
//! exhausted.
//!
//! Before running:
//! - Replace the access token placeholder below.
//! - Set `RUST_LOG=delta_stream_sdk=debug` to see reconnect activity.

use std::error::Error;

use delta_stream_sdk::api::ClientConfig;
use delta_stream_sdk::stream::proto::{DeltaEvent, DeltaParams};
use delta_stream_sdk::DeltaClient;
use secrecy::SecretString;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let access_token = "REPLACE_WITH_ACCESS_TOKEN".to_string();
    let client = DeltaClient::new(ClientConfig::new(SecretString::new(access_token)))?;
    let params = DeltaParams::default().include(["message", "thread"]);

    let mut stream = client.start_stream(None, params).await?;
    println!("streaming from cursor={:?}", stream.cursor());

    while let Some(event) = stream.recv().await {
        match event {
            DeltaEvent::Response(info) => println!("connected status={}", info.status),
            DeltaEvent::Delta(delta) => {
                println!(
                    "delta cursor={} object={} kind={} id={}",
                    delta.cursor.as_deref().unwrap_or("-"),
                    delta.object.as_deref().unwrap_or("-"),
                    delta.kind.as_deref().unwrap_or("-"),
                    delta.id.as_deref().unwrap_or("-"),
                );
            }
            DeltaEvent::Info(info) => println!("{info}"),
            DeltaEvent::Error(error) if error.is_terminal() => {
                eprintln!("stream failed: {error}");
                break;
            }
            DeltaEvent::Error(error) => eprintln!("stream error: {error}"),
        }
    }

    println!("last cursor={:?}", stream.cursor());
    stream.close();
    Ok(())
}
