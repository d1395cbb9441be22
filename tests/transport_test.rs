//! Transport tests
//!
//! Runs a test service behind an `RpcServer` on one end of an in-memory
//! duplex pipe and drives it through an `RpcClient` on the other end:
//! - unary and client-streaming calls
//! - concurrent calls on one connection
//! - remote failures and a lost connection
//! - calls abandoned by the client

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::DuplexStream;

use livesync::protocol::{
	Message, Method, ProtocolError, ProtocolResult, RpcClient, RpcServer, ServerCall, Service,
	StreamJoint,
};

// ============================================================================
// Test Service
// ============================================================================

#[derive(Default)]
struct TestService {
	cancelled: Arc<AtomicBool>,
}

#[async_trait]
impl Service for TestService {
	async fn handle(&self, method: Method, call: &mut ServerCall) -> ProtocolResult<()> {
		match method {
			Method::Ping => {
				call.request().await?;
				call.send_message(Message::Empty).await
			}
			// counts uploaded bytes
			Method::Upload => {
				let mut total = 0usize;
				while let Some(chunk) = call.recv_chunk().await? {
					total += chunk.len();
				}
				call.send_message(Message::ChangeAmount { amount: total as i64 }).await
			}
			Method::Remove => {
				call.request().await?;
				Err(ProtocolError::Other("removal denied".to_string()))
			}
			// echoes every requested path back as a chunk
			Method::Download => {
				let mut names = Vec::new();
				while let Some(Message::Paths { paths }) = call.recv_message().await? {
					names.extend(paths);
				}
				for name in names {
					call.send_chunk(name.into_bytes()).await?;
				}
				Ok(())
			}
			// waits until the client gives up
			Method::Changes => {
				match call.recv().await {
					Err(ProtocolError::Remote(_)) => self.cancelled.store(true, Ordering::SeqCst),
					other => panic!("unexpected {:?}", other),
				}
				Ok(())
			}
			Method::ChangesCount => {
				call.request().await?;
				tokio::time::sleep(Duration::from_millis(50)).await;
				call.send_message(Message::ChangeAmount { amount: 7 }).await
			}
		}
	}
}

// ============================================================================
// Helper Functions
// ============================================================================

fn connect(service: TestService) -> (RpcClient, tokio::task::JoinHandle<ProtocolResult<()>>) {
	let (client_end, server_end) = tokio::io::duplex(64 * 1024);
	let server = tokio::spawn(async move { RpcServer::new(service).serve(server_end).await });
	(RpcClient::new(client_end), server)
}

fn split_pipes() -> (StreamJoint<DuplexStream, DuplexStream>, StreamJoint<DuplexStream, DuplexStream>) {
	let (client_read, server_write) = tokio::io::duplex(64 * 1024);
	let (server_read, client_write) = tokio::io::duplex(64 * 1024);
	(StreamJoint::new(client_read, client_write), StreamJoint::new(server_read, server_write))
}

// ============================================================================
// Tests
// ============================================================================

#[tokio::test]
async fn test_unary_call() {
	let (client, _server) = connect(TestService::default());
	let response = client.unary(Method::Ping, Message::Empty).await.unwrap();
	assert_eq!(response, Message::Empty);
	client.ping(Duration::from_secs(1)).await.unwrap();
}

#[tokio::test]
async fn test_client_streaming_upload() {
	let (client, _server) = connect(TestService::default());
	let mut call = client.open(Method::Upload).await.unwrap();
	call.send_chunk(vec![0u8; 16 * 1024]).await.unwrap();
	call.send_chunk(vec![1u8; 100]).await.unwrap();

	let response = call.close_and_recv().await.unwrap();
	assert_eq!(response, Message::ChangeAmount { amount: 16 * 1024 + 100 });
}

#[tokio::test]
async fn test_bidirectional_download() {
	let (client, _server) = connect(TestService::default());
	let mut call = client.open(Method::Download).await.unwrap();
	call.send_message(Message::Paths { paths: vec!["a".into(), "b/c".into()] }).await.unwrap();
	call.send_message(Message::Paths { paths: vec!["d".into()] }).await.unwrap();
	call.close_send().await.unwrap();

	let mut received = Vec::new();
	while let Some(chunk) = call.recv_chunk().await.unwrap() {
		received.push(String::from_utf8(chunk).unwrap());
	}
	assert_eq!(received, vec!["a", "b/c", "d"]);
}

#[tokio::test]
async fn test_concurrent_calls() {
	let (client, _server) = connect(TestService::default());

	let slow = client.unary(Method::ChangesCount, Message::Empty);
	let fast = async {
		let mut call = client.open(Method::Upload).await?;
		call.send_chunk(vec![0u8; 10]).await?;
		call.close_and_recv().await
	};
	let (slow, fast) = tokio::join!(slow, fast);

	assert_eq!(slow.unwrap(), Message::ChangeAmount { amount: 7 });
	assert_eq!(fast.unwrap(), Message::ChangeAmount { amount: 10 });
}

#[tokio::test]
async fn test_remote_error_fails_only_that_call() {
	let (client, _server) = connect(TestService::default());

	let err = client.unary(Method::Remove, Message::Paths { paths: vec!["x".into()] }).await;
	match err {
		Err(ProtocolError::Remote(msg)) => assert!(msg.contains("removal denied")),
		other => panic!("expected a remote error, got {:?}", other),
	}
	assert!(!ProtocolError::Remote(String::new()).is_fatal());

	// the connection is still usable
	client.ping(Duration::from_secs(1)).await.unwrap();
}

#[tokio::test]
async fn test_abandoned_call_is_cancelled_on_server() {
	let service = TestService::default();
	let cancelled = service.cancelled.clone();
	let (client, _server) = connect(service);

	let call = client.open(Method::Changes).await.unwrap();
	drop(call);

	for _ in 0..100 {
		if cancelled.load(Ordering::SeqCst) {
			break;
		}
		tokio::time::sleep(Duration::from_millis(10)).await;
	}
	assert!(cancelled.load(Ordering::SeqCst));
}

#[tokio::test]
async fn test_lost_connection_fails_pending_calls() {
	let (client_end, server_end) = tokio::io::duplex(64 * 1024);
	let client = RpcClient::new(client_end);
	let closed = client.closed();

	let mut call = client.open(Method::Changes).await.unwrap();
	drop(server_end);

	tokio::time::timeout(Duration::from_secs(1), closed.cancelled()).await.unwrap();
	assert!(matches!(call.recv().await, Err(ProtocolError::Closed)));
	assert!(matches!(
		client.unary(Method::Ping, Message::Empty).await,
		Err(ProtocolError::Closed)
	));
}

#[tokio::test]
async fn test_ping_times_out_on_silent_peer() {
	let (client_end, _server_end) = tokio::io::duplex(64 * 1024);
	let client = RpcClient::new(client_end);

	let result = client.ping(Duration::from_millis(50)).await;
	assert!(matches!(result, Err(ProtocolError::Timeout)));
}

#[tokio::test]
async fn test_over_joined_unidirectional_streams() {
	let (client_side, server_side) = split_pipes();
	tokio::spawn(async move { RpcServer::new(TestService::default()).serve(server_side).await });
	let client = RpcClient::new(client_side);

	let response = client.unary(Method::ChangesCount, Message::Empty).await.unwrap();
	assert_eq!(response, Message::ChangeAmount { amount: 7 });
}

#[tokio::test]
async fn test_server_stops_when_client_closes() {
	let (client, server) = connect(TestService::default());
	client.ping(Duration::from_secs(1)).await.unwrap();
	client.shutdown().await;

	let result = tokio::time::timeout(Duration::from_secs(1), server).await.unwrap().unwrap();
	assert!(result.is_ok());
}

// vim: ts=4
