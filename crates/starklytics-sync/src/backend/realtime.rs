// SPDX-License-Identifier: GPL-3.0

//! Realtime change channels.
//!
//! A single websocket connection is shared by every channel opened through a
//! [`RealtimeClient`]. It is established lazily on the first subscription and driven by a
//! background task which:
//!
//! - joins and leaves channel topics on request,
//! - routes `postgres_changes` messages to the stream of the topic they belong to,
//! - sends a heartbeat every `heartbeat` interval.
//!
//! When the socket closes, every open stream ends. The next subscription reconnects.

use super::{ChangeEvent, ChangeKind, ChangeStream, ChannelSpec};
use crate::{
	error::BackendError,
	strings::realtime::{
		DEFAULT_SCHEMA, HEARTBEAT_TOPIC, PROTOCOL_VERSION, TOPIC_PREFIX, WEBSOCKET_PATH, events,
		status,
	},
};
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use starklytics_common::BackendConfig;
use std::{collections::HashMap, fmt, time::Duration};
use tokio::{
	net::TcpStream,
	sync::{
		Mutex,
		mpsc::{self, error::TrySendError},
		oneshot,
	},
	time::{Instant, interval_at, timeout},
};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async, tungstenite::Message};
use url::Url;

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Capacity of each channel's event buffer.
const EVENT_BUFFER: usize = 64;
/// Capacity of the command queue of the connection task.
const COMMAND_BUFFER: usize = 32;
/// How long to wait for the backend to acknowledge a join, by default.
const JOIN_TIMEOUT: Duration = Duration::from_secs(10);

/// A message of the channel protocol.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct ProtocolMessage {
	topic: String,
	event: String,
	#[serde(default)]
	payload: Value,
	#[serde(rename = "ref", default)]
	reference: Option<String>,
}

impl ProtocolMessage {
	fn new(topic: &str, event: &str, payload: Value, reference: u64) -> Self {
		Self {
			topic: topic.to_string(),
			event: event.to_string(),
			payload,
			reference: Some(reference.to_string()),
		}
	}
}

enum Command {
	Join {
		topic: String,
		payload: Value,
		events: mpsc::Sender<ChangeEvent>,
		reply: oneshot::Sender<Result<(), BackendError>>,
	},
	Leave {
		topic: String,
		reply: oneshot::Sender<Result<(), BackendError>>,
	},
}

/// Client for the realtime websocket of a hosted instance.
pub struct RealtimeClient {
	endpoint: Url,
	api_key: String,
	heartbeat: Duration,
	join_timeout: Duration,
	commands: Mutex<Option<mpsc::Sender<Command>>>,
}

impl fmt::Debug for RealtimeClient {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("RealtimeClient")
			.field("endpoint", &self.endpoint.path())
			.field("heartbeat", &self.heartbeat)
			.finish_non_exhaustive()
	}
}

impl RealtimeClient {
	/// Creates a client. The connection is established on the first subscription.
	///
	/// # Arguments
	/// * `config` - The instance to connect to.
	/// * `heartbeat` - Interval between two heartbeats on an open connection.
	pub fn new(config: &BackendConfig, heartbeat: Duration) -> Result<Self, BackendError> {
		let mut endpoint = config.websocket_endpoint(WEBSOCKET_PATH)?;
		endpoint
			.query_pairs_mut()
			.append_pair("apikey", config.anon_key())
			.append_pair("vsn", PROTOCOL_VERSION);
		Ok(Self {
			endpoint,
			api_key: config.anon_key().to_string(),
			heartbeat,
			join_timeout: JOIN_TIMEOUT,
			commands: Mutex::new(None),
		})
	}

	/// Sets how long a join may wait for the backend's acknowledgement.
	pub fn with_join_timeout(mut self, join_timeout: Duration) -> Self {
		self.join_timeout = join_timeout;
		self
	}

	/// Joins the channel described by `channel`, returning its change stream.
	pub async fn subscribe(&self, channel: ChannelSpec) -> Result<ChangeStream, BackendError> {
		let commands = self.connection().await?;
		let (events, stream) = mpsc::channel(EVENT_BUFFER);
		let (reply, joined) = oneshot::channel();
		let topic = topic(&channel.name);
		let payload = join_payload(&channel, &self.api_key);
		commands
			.send(Command::Join { topic: topic.clone(), payload, events, reply })
			.await
			.map_err(|_| BackendError::Realtime("connection closed".into()))?;
		match timeout(self.join_timeout, joined).await {
			Ok(Ok(result)) => result?,
			Ok(Err(_)) => return Err(BackendError::Realtime("connection closed".into())),
			Err(_) => {
				// A late acknowledgement would leave the channel joined on the backend.
				log::warn!("joining {topic} timed out, leaving it");
				let (reply, _) = oneshot::channel();
				let _ = commands.send(Command::Leave { topic: topic.clone(), reply }).await;
				return Err(BackendError::Realtime(format!("joining {topic} timed out")));
			},
		}
		log::debug!("joined {topic}");
		Ok(stream)
	}

	/// Leaves the named channel. Does nothing when no connection is open.
	pub async fn unsubscribe(&self, channel: &str) -> Result<(), BackendError> {
		let Some(commands) = self.commands.lock().await.clone().filter(|c| !c.is_closed()) else {
			return Ok(());
		};
		let (reply, left) = oneshot::channel();
		if commands.send(Command::Leave { topic: topic(channel), reply }).await.is_err() {
			return Ok(());
		}
		left.await.unwrap_or(Ok(()))
	}

	/// The command queue of the open connection, connecting first if needed.
	async fn connection(&self) -> Result<mpsc::Sender<Command>, BackendError> {
		let mut slot = self.commands.lock().await;
		if let Some(commands) = slot.as_ref().filter(|c| !c.is_closed()) {
			return Ok(commands.clone());
		}
		let (socket, _) = connect_async(self.endpoint.as_str())
			.await
			.map_err(|e| BackendError::Unreachable(e.to_string()))?;
		log::debug!("realtime connection established");
		let (commands, queue) = mpsc::channel(COMMAND_BUFFER);
		tokio::spawn(run_connection(socket, queue, self.heartbeat));
		*slot = Some(commands.clone());
		Ok(commands)
	}
}

fn topic(channel: &str) -> String {
	format!("{TOPIC_PREFIX}{channel}")
}

/// Builds the join payload requesting the changes of one table.
fn join_payload(channel: &ChannelSpec, api_key: &str) -> Value {
	let schema = if channel.schema.is_empty() { DEFAULT_SCHEMA } else { &channel.schema };
	let mut changes = json!({
		"event": events::ALL_CHANGES,
		"schema": schema,
		"table": channel.table,
	});
	if let Some(filter) = &channel.filter {
		changes["filter"] = Value::String(filter.to_string());
	}
	json!({
		"config": { "postgres_changes": [changes] },
		"access_token": api_key,
	})
}

/// Extracts a change event from a `postgres_changes` payload.
fn parse_change(payload: &Value) -> Option<ChangeEvent> {
	let data = payload.get("data")?;
	let kind = ChangeKind::parse(data.get("type")?.as_str()?)?;
	Some(ChangeEvent {
		kind,
		table: data.get("table").and_then(Value::as_str).unwrap_or_default().to_string(),
		record: data.get("record").cloned().unwrap_or(Value::Null),
		old_record: data.get("old_record").cloned().unwrap_or(Value::Null),
	})
}

async fn send(socket: &mut Socket, message: &ProtocolMessage) -> Result<(), BackendError> {
	let text = serde_json::to_string(message).map_err(|e| BackendError::Realtime(e.to_string()))?;
	socket
		.send(Message::Text(text.into()))
		.await
		.map_err(|e| BackendError::Realtime(e.to_string()))
}

/// Drives one websocket connection until it closes or every client handle is dropped.
async fn run_connection(mut socket: Socket, mut commands: mpsc::Receiver<Command>, heartbeat: Duration) {
	let mut routes: HashMap<String, mpsc::Sender<ChangeEvent>> = HashMap::new();
	let mut pending: HashMap<String, (String, oneshot::Sender<Result<(), BackendError>>)> =
		HashMap::new();
	let mut next_ref: u64 = 0;
	let heartbeat = heartbeat.max(Duration::from_millis(1));
	let mut ticker = interval_at(Instant::now() + heartbeat, heartbeat);

	loop {
		tokio::select! {
			command = commands.recv() => match command {
				Some(Command::Join { topic, payload, events, reply }) => {
					next_ref += 1;
					let message = ProtocolMessage::new(&topic, events::JOIN, payload, next_ref);
					if let Err(e) = send(&mut socket, &message).await {
						let _ = reply.send(Err(e));
						break;
					}
					routes.insert(topic.clone(), events);
					pending.insert(next_ref.to_string(), (topic, reply));
				},
				Some(Command::Leave { topic, reply }) => {
					next_ref += 1;
					routes.remove(&topic);
					pending.retain(|_, (joining, _)| *joining != topic);
					let message = ProtocolMessage::new(&topic, events::LEAVE, json!({}), next_ref);
					let result = send(&mut socket, &message).await;
					let failed = result.is_err();
					let _ = reply.send(result);
					if failed {
						break;
					}
				},
				None => break,
			},
			_ = ticker.tick() => {
				next_ref += 1;
				let message = ProtocolMessage::new(HEARTBEAT_TOPIC, events::HEARTBEAT, json!({}), next_ref);
				if let Err(e) = send(&mut socket, &message).await {
					log::warn!("realtime heartbeat failed: {e}");
					break;
				}
			},
			frame = socket.next() => match frame {
				Some(Ok(Message::Text(text))) => {
					match serde_json::from_str::<ProtocolMessage>(text.as_str()) {
						Ok(message) => dispatch(message, &mut routes, &mut pending),
						Err(e) => log::warn!("ignoring malformed realtime message: {e}"),
					}
				},
				Some(Ok(Message::Ping(payload))) => {
					let _ = socket.send(Message::Pong(payload)).await;
				},
				Some(Ok(Message::Close(_))) | None => {
					log::debug!("realtime connection closed by the backend");
					break;
				},
				Some(Ok(_)) => {},
				Some(Err(e)) => {
					log::warn!("realtime connection failed: {e}");
					break;
				},
			},
		}
	}

	for (_, (topic, reply)) in pending.drain() {
		let _ = reply.send(Err(BackendError::Realtime(format!("connection closed before joining {topic}"))));
	}
	// Dropping the routes ends every open stream.
	routes.clear();
	let _ = socket.close(None).await;
}

fn dispatch(
	message: ProtocolMessage,
	routes: &mut HashMap<String, mpsc::Sender<ChangeEvent>>,
	pending: &mut HashMap<String, (String, oneshot::Sender<Result<(), BackendError>>)>,
) {
	match message.event.as_str() {
		events::REPLY => {
			let Some((topic, reply)) = message.reference.and_then(|r| pending.remove(&r)) else {
				return;
			};
			if message.payload.get("status").and_then(Value::as_str) == Some(status::OK) {
				let _ = reply.send(Ok(()));
			} else {
				routes.remove(&topic);
				let response = message.payload.get("response").cloned().unwrap_or(Value::Null);
				let _ = reply.send(Err(BackendError::Realtime(format!(
					"joining {topic} was rejected: {response}"
				))));
			}
		},
		events::POSTGRES_CHANGES => {
			let Some(change) = parse_change(&message.payload) else {
				log::warn!("ignoring unrecognised change on {}", message.topic);
				return;
			};
			let Some(events) = routes.get(&message.topic) else { return };
			match events.try_send(change) {
				Ok(()) => {},
				// The connection task serves every channel, so a lagging consumer loses events.
				Err(TrySendError::Full(_)) => {
					log::warn!("dropping a change on {}: its consumer is lagging", message.topic)
				},
				// Receiver dropped without leaving.
				Err(TrySendError::Closed(_)) => {
					routes.remove(&message.topic);
				},
			}
		},
		events::ERROR | events::CLOSE => {
			log::warn!("channel {} closed by the backend", message.topic);
			routes.remove(&message.topic);
		},
		_ => {},
	}
}
