//! Blocking obs-websocket client.
//!
//! One `ObsClient` is one authenticated WebSocket session. Every request carries a
//! deadline; a request that misses it fails with `ControlPlaneError::Timeout`, which the
//! lifecycle manager treats as a dead link. Events that arrive while a response is
//! awaited are queued and handed out by `next_notification`.

use std::collections::VecDeque;
use std::io::ErrorKind;
use std::net::{TcpStream, ToSocketAddrs};
use std::time::{Duration, Instant};

use serde::Serialize;
use serde_json::{json, Value};
use tungstenite::client::IntoClientRequest;
use tungstenite::http::HeaderValue;
use tungstenite::protocol::frame::coding::CloseCode;
use tungstenite::{Message, WebSocket};

use super::protocol::{
    self, op, Envelope, Hello, Identify, Request, RequestBatch, RequestBatchResponse,
    RequestResponse,
};
use crate::control::{ControlPlane, Notification, OutputState, SceneItem};
use crate::error::ControlPlaneError;
use crate::lifecycle::Connector;

const SUBPROTOCOL: &str = "obswebsocket.json";
const MIN_READ_TIMEOUT: Duration = Duration::from_millis(1);

/// Where and how to reach obs-websocket.
#[derive(Clone, Debug)]
pub struct ObsEndpoint {
    pub host: String,
    pub port: u16,
    pub password: Option<String>,
    pub connect_timeout: Duration,
    pub request_timeout: Duration,
}

impl Default for ObsEndpoint {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 4455,
            password: None,
            connect_timeout: Duration::from_secs(3),
            request_timeout: Duration::from_secs(3),
        }
    }
}

impl ObsEndpoint {
    pub fn url(&self) -> String {
        format!("ws://{}:{}", self.host, self.port)
    }
}

pub struct ObsClient {
    socket: WebSocket<TcpStream>,
    request_timeout: Duration,
    next_request_id: u64,
    pending: VecDeque<Notification>,
    closed: bool,
}

impl ObsClient {
    /// Open the socket and complete the Hello / Identify / Identified handshake.
    pub fn connect(endpoint: &ObsEndpoint) -> Result<Self, ControlPlaneError> {
        let stream = open_tcp(endpoint)?;
        let mut request = endpoint
            .url()
            .into_client_request()
            .map_err(|e| ControlPlaneError::Connection(format!("bad endpoint: {}", e)))?;
        request
            .headers_mut()
            .insert("Sec-WebSocket-Protocol", HeaderValue::from_static(SUBPROTOCOL));
        let (socket, _response) = tungstenite::client::client(request, stream)
            .map_err(|e| ControlPlaneError::Connection(format!("websocket handshake: {}", e)))?;

        let mut client = Self {
            socket,
            request_timeout: endpoint.request_timeout,
            next_request_id: 0,
            pending: VecDeque::new(),
            closed: false,
        };
        client.identify(endpoint)?;
        log::info!("connected to obs-websocket at {}", endpoint.url());
        Ok(client)
    }

    fn identify(&mut self, endpoint: &ObsEndpoint) -> Result<(), ControlPlaneError> {
        let deadline = Instant::now() + endpoint.connect_timeout;
        let hello = self.expect_op(op::HELLO, "Hello", deadline)?;
        let hello: Hello = serde_json::from_value(hello)
            .map_err(|e| ControlPlaneError::Protocol(format!("Hello: {}", e)))?;
        log::debug!(
            "obs-websocket {} (rpc {})",
            hello.obs_web_socket_version.as_deref().unwrap_or("unknown"),
            hello.rpc_version
        );

        let authentication = match (&hello.authentication, endpoint.password.as_deref()) {
            (Some(challenge), Some(password)) => Some(protocol::auth_response(
                password,
                &challenge.salt,
                &challenge.challenge,
            )),
            (Some(_), None) => {
                return Err(ControlPlaneError::Auth(
                    "server requires a password but none is configured".to_string(),
                ))
            }
            (None, _) => None,
        };

        self.send(
            op::IDENTIFY,
            &Identify {
                rpc_version: protocol::RPC_VERSION,
                authentication,
                event_subscriptions: protocol::subscription::CONTROLLER,
            },
        )?;
        self.expect_op(op::IDENTIFIED, "Identified", deadline)?;
        Ok(())
    }

    fn expect_op(
        &mut self,
        expected: u8,
        name: &str,
        deadline: Instant,
    ) -> Result<Value, ControlPlaneError> {
        loop {
            match self.read_envelope(deadline)? {
                Some(env) if env.op == expected => return Ok(env.d),
                Some(env) => self.absorb(env),
                None => {
                    return Err(ControlPlaneError::Timeout {
                        request: name.to_string(),
                        after: self.request_timeout,
                    })
                }
            }
        }
    }

    fn send<T: Serialize>(&mut self, opcode: u8, payload: &T) -> Result<(), ControlPlaneError> {
        let d = serde_json::to_value(payload)
            .map_err(|e| ControlPlaneError::Protocol(format!("encode op {}: {}", opcode, e)))?;
        let text = serde_json::to_string(&Envelope { op: opcode, d })
            .map_err(|e| ControlPlaneError::Protocol(format!("encode op {}: {}", opcode, e)))?;
        self.socket
            .send(Message::Text(text))
            .map_err(|e| self.link_error(e))
    }

    /// Read one envelope, or `None` if `deadline` passes first.
    fn read_envelope(&mut self, deadline: Instant) -> Result<Option<Envelope>, ControlPlaneError> {
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(None);
            }
            self.socket
                .get_mut()
                .set_read_timeout(Some(remaining.max(MIN_READ_TIMEOUT)))
                .map_err(|e| ControlPlaneError::Connection(e.to_string()))?;

            match self.socket.read() {
                Ok(Message::Text(text)) => {
                    let env: Envelope = serde_json::from_str(&text)
                        .map_err(|e| ControlPlaneError::Protocol(format!("bad frame: {}", e)))?;
                    return Ok(Some(env));
                }
                Ok(Message::Close(frame)) => {
                    self.closed = true;
                    return Err(match frame {
                        Some(f)
                            if f.code == CloseCode::from(protocol::CLOSE_AUTHENTICATION_FAILED) =>
                        {
                            ControlPlaneError::Auth(f.reason.to_string())
                        }
                        Some(f) => ControlPlaneError::Connection(format!(
                            "closed by peer ({}): {}",
                            u16::from(f.code),
                            f.reason
                        )),
                        None => ControlPlaneError::Connection("closed by peer".to_string()),
                    });
                }
                // Pings are answered by tungstenite on the next read or write.
                Ok(_) => continue,
                Err(tungstenite::Error::Io(e))
                    if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) =>
                {
                    continue
                }
                Err(e) => return Err(self.link_error(e)),
            }
        }
    }

    /// Queue events that arrive out of band.
    fn absorb(&mut self, env: Envelope) {
        if env.op != op::EVENT {
            log::debug!("ignoring unexpected op {}", env.op);
            return;
        }
        match serde_json::from_value::<protocol::Event>(env.d) {
            Ok(event) => {
                if let Some(notification) = protocol::classify_event(&event) {
                    log::debug!("obs event {} -> {:?}", event.event_type, notification);
                    self.pending.push_back(notification);
                }
            }
            Err(e) => log::debug!("ignoring malformed event: {}", e),
        }
    }

    fn link_error(&mut self, err: tungstenite::Error) -> ControlPlaneError {
        self.closed = true;
        ControlPlaneError::Connection(err.to_string())
    }

    fn request_id(&mut self) -> String {
        self.next_request_id += 1;
        self.next_request_id.to_string()
    }

    fn ensure_open(&self) -> Result<(), ControlPlaneError> {
        if self.closed {
            return Err(ControlPlaneError::Connection("session closed".to_string()));
        }
        Ok(())
    }

    /// Issue one request and wait for its response.
    pub fn request(
        &mut self,
        request_type: &str,
        request_data: Option<Value>,
    ) -> Result<Value, ControlPlaneError> {
        self.ensure_open()?;
        let request_id = self.request_id();
        self.send(
            op::REQUEST,
            &Request {
                request_type,
                request_id: request_id.clone(),
                request_data,
            },
        )?;

        let deadline = Instant::now() + self.request_timeout;
        loop {
            let Some(env) = self.read_envelope(deadline)? else {
                self.closed = true;
                return Err(ControlPlaneError::Timeout {
                    request: request_type.to_string(),
                    after: self.request_timeout,
                });
            };
            if env.op != op::REQUEST_RESPONSE {
                self.absorb(env);
                continue;
            }
            let response: RequestResponse = serde_json::from_value(env.d).map_err(|e| {
                ControlPlaneError::Protocol(format!("{} response: {}", request_type, e))
            })?;
            if response.request_id.as_deref() != Some(request_id.as_str()) {
                log::debug!(
                    "dropping stale response {:?} for {}",
                    response.request_id,
                    response.request_type
                );
                continue;
            }
            return response.into_result();
        }
    }

    /// Issue several requests in one round trip. Results keep request order.
    pub fn request_batch(
        &mut self,
        requests: Vec<(&str, Option<Value>)>,
    ) -> Result<Vec<Result<Value, ControlPlaneError>>, ControlPlaneError> {
        self.ensure_open()?;
        let batch_id = self.request_id();
        let requests: Vec<Request<'_>> = requests
            .into_iter()
            .enumerate()
            .map(|(i, (request_type, request_data))| Request {
                request_type,
                request_id: i.to_string(),
                request_data,
            })
            .collect();
        let expected = requests.len();
        self.send(
            op::REQUEST_BATCH,
            &RequestBatch {
                request_id: batch_id.clone(),
                halt_on_failure: false,
                requests,
            },
        )?;

        let deadline = Instant::now() + self.request_timeout;
        loop {
            let Some(env) = self.read_envelope(deadline)? else {
                self.closed = true;
                return Err(ControlPlaneError::Timeout {
                    request: "RequestBatch".to_string(),
                    after: self.request_timeout,
                });
            };
            if env.op != op::REQUEST_BATCH_RESPONSE {
                self.absorb(env);
                continue;
            }
            let response: RequestBatchResponse = serde_json::from_value(env.d)
                .map_err(|e| ControlPlaneError::Protocol(format!("RequestBatch response: {}", e)))?;
            if response.request_id != batch_id {
                continue;
            }
            if response.results.len() != expected {
                return Err(ControlPlaneError::Protocol(format!(
                    "RequestBatch returned {} results for {} requests",
                    response.results.len(),
                    expected
                )));
            }
            return Ok(response
                .results
                .into_iter()
                .map(RequestResponse::into_result)
                .collect());
        }
    }
}

fn open_tcp(endpoint: &ObsEndpoint) -> Result<TcpStream, ControlPlaneError> {
    let addrs = (endpoint.host.as_str(), endpoint.port)
        .to_socket_addrs()
        .map_err(|e| {
            ControlPlaneError::Connection(format!("resolve {}: {}", endpoint.host, e))
        })?;
    let mut last_err = None;
    for addr in addrs {
        match TcpStream::connect_timeout(&addr, endpoint.connect_timeout) {
            Ok(stream) => {
                stream
                    .set_write_timeout(Some(endpoint.request_timeout))
                    .map_err(|e| ControlPlaneError::Connection(e.to_string()))?;
                stream
                    .set_read_timeout(Some(endpoint.connect_timeout))
                    .map_err(|e| ControlPlaneError::Connection(e.to_string()))?;
                let _ = stream.set_nodelay(true);
                return Ok(stream);
            }
            Err(e) => last_err = Some(e),
        }
    }
    Err(ControlPlaneError::Connection(match last_err {
        Some(e) => format!("connect {}: {}", endpoint.url(), e),
        None => format!("no addresses for {}", endpoint.host),
    }))
}

impl ControlPlane for ObsClient {
    fn list_scenes(&mut self) -> Result<Vec<String>, ControlPlaneError> {
        let data = self.request("GetSceneList", None)?;
        protocol::parse_scene_list(data)
    }

    fn list_sources_in_scene(&mut self, scene: &str) -> Result<Vec<SceneItem>, ControlPlaneError> {
        let data = self.request("GetSceneItemList", Some(json!({ "sceneName": scene })))?;
        protocol::parse_scene_items(data)
    }

    fn list_sources_in_scenes(
        &mut self,
        scenes: &[String],
    ) -> Result<Vec<(String, Vec<SceneItem>)>, ControlPlaneError> {
        if scenes.is_empty() {
            return Ok(Vec::new());
        }
        let requests = scenes
            .iter()
            .map(|scene| ("GetSceneItemList", Some(json!({ "sceneName": scene }))))
            .collect();
        let results = self.request_batch(requests)?;

        let mut listings = Vec::with_capacity(scenes.len());
        for (scene, result) in scenes.iter().zip(results) {
            match result {
                Ok(data) => listings.push((scene.clone(), protocol::parse_scene_items(data)?)),
                Err(e) if e.is_not_found() => {
                    log::debug!("scene '{}' disappeared during enumeration", scene);
                }
                Err(e) => return Err(e),
            }
        }
        Ok(listings)
    }

    fn set_source_visible(
        &mut self,
        scene: &str,
        source: &str,
        visible: bool,
    ) -> Result<(), ControlPlaneError> {
        let ids: Vec<i64> = self
            .list_sources_in_scene(scene)?
            .into_iter()
            .filter(|item| item.source_name == source)
            .map(|item| item.id)
            .collect();
        if ids.is_empty() {
            return Err(ControlPlaneError::NotFound {
                request: "SetSceneItemEnabled".to_string(),
                detail: format!("source '{}' is not in scene '{}'", source, scene),
            });
        }
        self.set_items_enabled(scene, source, &ids, visible)
    }

    fn set_items_enabled(
        &mut self,
        scene: &str,
        source: &str,
        item_ids: &[i64],
        visible: bool,
    ) -> Result<(), ControlPlaneError> {
        if item_ids.is_empty() {
            return self.set_source_visible(scene, source, visible);
        }
        let requests = item_ids
            .iter()
            .map(|id| {
                (
                    "SetSceneItemEnabled",
                    Some(json!({
                        "sceneName": scene,
                        "sceneItemId": id,
                        "sceneItemEnabled": visible,
                    })),
                )
            })
            .collect();
        for result in self.request_batch(requests)? {
            result?;
        }
        Ok(())
    }

    fn streaming_state(&mut self) -> Result<bool, ControlPlaneError> {
        let data = self.request("GetStreamStatus", None)?;
        protocol::parse_output_active("GetStreamStatus", data)
    }

    fn recording_state(&mut self) -> Result<bool, ControlPlaneError> {
        let data = self.request("GetRecordStatus", None)?;
        protocol::parse_output_active("GetRecordStatus", data)
    }

    fn output_state(&mut self) -> Result<OutputState, ControlPlaneError> {
        let mut results = self
            .request_batch(vec![("GetStreamStatus", None), ("GetRecordStatus", None)])?
            .into_iter();
        let (Some(stream), Some(record)) = (results.next(), results.next()) else {
            return Err(ControlPlaneError::Protocol(
                "output status batch was short".to_string(),
            ));
        };
        Ok(OutputState {
            streaming: protocol::parse_output_active("GetStreamStatus", stream?)?,
            recording: protocol::parse_output_active("GetRecordStatus", record?)?,
        })
    }

    fn next_notification(
        &mut self,
        wait: Duration,
    ) -> Result<Option<Notification>, ControlPlaneError> {
        if let Some(notification) = self.pending.pop_front() {
            return Ok(Some(notification));
        }
        self.ensure_open()?;
        let deadline = Instant::now() + wait;
        while let Some(env) = self.read_envelope(deadline)? {
            self.absorb(env);
            if let Some(notification) = self.pending.pop_front() {
                return Ok(Some(notification));
            }
        }
        Ok(None)
    }

    fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        if let Err(e) = self.socket.close(None) {
            log::debug!("close handshake failed: {}", e);
            return;
        }
        // Drain until the peer acknowledges or the socket errors out.
        let _ = self.socket.get_mut().set_read_timeout(Some(MIN_READ_TIMEOUT * 250));
        while self.socket.read().is_ok() {}
        log::info!("disconnected from obs-websocket");
    }
}

impl Drop for ObsClient {
    fn drop(&mut self) {
        self.close();
    }
}

/// Opens a fresh `ObsClient` per connection attempt.
#[derive(Clone, Debug)]
pub struct ObsConnector {
    endpoint: ObsEndpoint,
}

impl ObsConnector {
    pub fn new(endpoint: ObsEndpoint) -> Self {
        Self { endpoint }
    }

    pub fn endpoint(&self) -> &ObsEndpoint {
        &self.endpoint
    }
}

impl Connector for ObsConnector {
    type Client = ObsClient;

    fn describe(&self) -> String {
        self.endpoint.url()
    }

    fn connect(&mut self) -> Result<ObsClient, ControlPlaneError> {
        ObsClient::connect(&self.endpoint)
    }
}
