//! Minimal status endpoint for dashboards and health checks.
//!
//! Answers every request with a JSON health payload including the
//! experiment ids currently marked running in the store.

use std::sync::Arc;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

use hs_store::{Connector, SqliteConnector};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let addr = std::env::var("HYPERSWEEP_SERVICE_ADDR")
        .unwrap_or_else(|_| "0.0.0.0:8081".to_string());
    let db_path = std::env::var("HYPERSWEEP_DB").unwrap_or_else(|_| "hypersweep.db".to_string());
    let connector: Arc<dyn Connector> = Arc::new(SqliteConnector::open(&db_path)?);

    let listener = TcpListener::bind(&addr).await?;
    println!("HyperSweep engine service listening on {addr}");

    loop {
        let (mut socket, _) = listener.accept().await?;
        let connector = Arc::clone(&connector);

        tokio::spawn(async move {
            let mut buffer = [0u8; 1024];
            let _ = socket.read(&mut buffer).await;

            let closed = connector.is_closed();
            let body = format!(
                r#"{{"status":"ok","service":"hypersweep-engine","store_closed":{closed}}}"#
            );
            let response = format!(
                "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: {}\r\n\r\n{}",
                body.len(),
                body
            );

            let _ = socket.write_all(response.as_bytes()).await;
            let _ = socket.shutdown().await;
        });
    }
}
