//! Public device API: configuration, commands, and event streaming.
//! A [`Device`] is a cheap cloneable handle onto a background session
//! task that owns the TCP connection.

use crate::discovery::{self, DiscoveredDevice, Discovery, FindQuery};
use crate::error::{Error, Result};
use crate::protocol::{CommandType, Version};
use crate::session::{self, SendRequest, SessionCommand, SessionConfig, SharedState, WaitFor};
use futures_core::stream::Stream;
use log::{debug, info};
use serde_json::{Map, Value, json};
use std::sync::{Arc, RwLock};
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::{Mutex, broadcast, mpsc, oneshot};
use tokio::time::Duration;
use tokio_util::sync::CancellationToken;

/// Default TCP control port.
pub const DEFAULT_PORT: u16 = 6668;

/// Events a device emits over its broadcast channel.
///
/// `Data`, `DpRefresh`, and `Error` fan out to every subscriber;
/// `Connected`, `Disconnected`, and `Heartbeat` mark state transitions.
#[derive(Debug, Clone)]
pub enum DeviceEvent {
    Connected,
    Disconnected,
    Heartbeat,
    /// A status report from the device.
    Data {
        payload: Value,
        command: u32,
        seq: u32,
    },
    /// A status report covering only silent DPs (no DP 1), as produced
    /// in response to a refresh.
    DpRefresh {
        payload: Value,
        command: u32,
        seq: u32,
    },
    Error(String),
}

/// Options for [`Device::get`].
#[derive(Debug, Clone, Default)]
pub struct GetOptions {
    /// Return the whole DP map instead of a single value.
    pub schema: bool,
    /// DP index to read; defaults to 1.
    pub dps: Option<u32>,
    /// Sub-device to address.
    pub cid: Option<String>,
}

/// Options for [`Device::set`].
#[derive(Debug, Clone)]
pub struct SetOptions {
    /// DP index to write; defaults to 1.
    pub dps: Option<u32>,
    /// Value to write.
    pub set: Option<Value>,
    /// Write several DPs at once from `data`.
    pub multiple: bool,
    /// DP map used when `multiple` is set.
    pub data: Option<Value>,
    /// Sub-device to address.
    pub cid: Option<String>,
    /// Wait for the device's STATUS reply (default) or resolve as soon
    /// as the frame is written.
    pub should_wait_for_response: bool,
}

impl Default for SetOptions {
    fn default() -> Self {
        Self {
            dps: None,
            set: None,
            multiple: false,
            data: None,
            cid: None,
            should_wait_for_response: true,
        }
    }
}

/// Options for [`Device::refresh`].
#[derive(Debug, Clone, Default)]
pub struct RefreshOptions {
    /// DP indices to force-report; defaults to the auto-tuned set.
    pub dp_ids: Option<Vec<u32>>,
    /// Sub-device to address.
    pub cid: Option<String>,
}

/// Builder for [`Device`].
///
/// ```rust,no_run
/// use lantuya::DeviceBuilder;
///
/// let device = DeviceBuilder::new()
///     .id("22325186db4a2217dc8e")
///     .key("4226aa407d5c1e2b")
///     .ip("192.168.1.40")
///     .version("3.3".parse().unwrap())
///     .build()
///     .unwrap();
/// ```
#[derive(Debug, Clone)]
pub struct DeviceBuilder {
    id: Option<String>,
    gw_id: Option<String>,
    cid: Option<String>,
    ip: Option<String>,
    port: u16,
    key: Option<Vec<u8>>,
    version: Version,
    heartbeat_period: Duration,
    response_timeout: Duration,
    connect_timeout: Duration,
    find_timeout: Duration,
    issue_get_on_connect: bool,
    issue_refresh_on_connect: bool,
    issue_refresh_on_ping: bool,
    null_payload_on_json_error: bool,
}

impl Default for DeviceBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl DeviceBuilder {
    pub fn new() -> Self {
        Self {
            id: None,
            gw_id: None,
            cid: None,
            ip: None,
            port: DEFAULT_PORT,
            key: None,
            version: Version::default(),
            heartbeat_period: Duration::from_secs(10),
            response_timeout: Duration::from_secs(2),
            connect_timeout: Duration::from_secs(5),
            find_timeout: Duration::from_secs(10),
            issue_get_on_connect: true,
            issue_refresh_on_connect: false,
            issue_refresh_on_ping: false,
            null_payload_on_json_error: false,
        }
    }

    pub fn id<S: Into<String>>(mut self, id: S) -> Self {
        self.id = Some(id.into());
        self
    }

    /// Gateway identifier; defaults to the device id.
    pub fn gateway_id<S: Into<String>>(mut self, gw_id: S) -> Self {
        self.gw_id = Some(gw_id.into());
        self
    }

    /// Sub-device node id behind a gateway.
    pub fn cid<S: Into<String>>(mut self, cid: S) -> Self {
        self.cid = Some(cid.into());
        self
    }

    pub fn ip<S: Into<String>>(mut self, ip: S) -> Self {
        self.ip = Some(ip.into());
        self
    }

    pub fn port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// 16-byte local key provisioned on the device.
    pub fn key<K: Into<Vec<u8>>>(mut self, key: K) -> Self {
        self.key = Some(key.into());
        self
    }

    pub fn version(mut self, version: Version) -> Self {
        self.version = version;
        self
    }

    pub fn heartbeat_period(mut self, period: Duration) -> Self {
        self.heartbeat_period = period;
        self
    }

    /// Base response window in seconds; sets and queries get 2.5× this.
    pub fn response_timeout(mut self, timeout: Duration) -> Self {
        self.response_timeout = timeout;
        self
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn find_timeout(mut self, timeout: Duration) -> Self {
        self.find_timeout = timeout;
        self
    }

    pub fn issue_get_on_connect(mut self, enabled: bool) -> Self {
        self.issue_get_on_connect = enabled;
        self
    }

    pub fn issue_refresh_on_connect(mut self, enabled: bool) -> Self {
        self.issue_refresh_on_connect = enabled;
        self
    }

    pub fn issue_refresh_on_ping(mut self, enabled: bool) -> Self {
        self.issue_refresh_on_ping = enabled;
        self
    }

    pub fn null_payload_on_json_error(mut self, enabled: bool) -> Self {
        self.null_payload_on_json_error = enabled;
        self
    }

    /// Validate the configuration and spawn the device's session task.
    ///
    /// Fails when the key is missing or not exactly 16 bytes, or when
    /// neither an id nor an ip address is given.
    pub fn build(self) -> Result<Device> {
        let key_bytes = self
            .key
            .ok_or_else(|| Error::Config("a 16-byte local key is required".into()))?;
        let key: [u8; 16] = key_bytes.try_into().map_err(|v: Vec<u8>| {
            Error::Config(format!("local key must be 16 bytes, got {}", v.len()))
        })?;
        if self.id.is_none() && self.ip.is_none() {
            return Err(Error::Config(
                "either a device id or an ip address is required".into(),
            ));
        }

        let id = self.id.unwrap_or_default();
        let gw_id = self.gw_id.unwrap_or_else(|| id.clone());
        let shared = Arc::new(RwLock::new(SharedState {
            id,
            gw_id,
            ip: self.ip,
            version: self.version,
            product_key: None,
            refresh_dps: vec![18, 19, 20],
            connected: false,
        }));

        let (events, _) = broadcast::channel(32);
        let cancel = CancellationToken::new();
        let tx = session::spawn(
            SessionConfig {
                port: self.port,
                connect_timeout: self.connect_timeout,
                heartbeat_period: self.heartbeat_period,
                response_timeout: self.response_timeout,
                issue_get_on_connect: self.issue_get_on_connect,
                issue_refresh_on_connect: self.issue_refresh_on_connect,
                issue_refresh_on_ping: self.issue_refresh_on_ping,
                null_payload_on_json_error: self.null_payload_on_json_error,
            },
            key,
            shared.clone(),
            events.clone(),
            cancel.clone(),
        );

        Ok(Device {
            inner: Arc::new(DeviceInner {
                tx,
                events,
                shared,
                key,
                cid: self.cid,
                find_timeout: self.find_timeout,
                set_lock: Mutex::new(()),
                cancel,
            }),
        })
    }
}

struct DeviceInner {
    tx: mpsc::Sender<SessionCommand>,
    events: broadcast::Sender<DeviceEvent>,
    shared: Arc<RwLock<SharedState>>,
    key: [u8; 16],
    cid: Option<String>,
    find_timeout: Duration,
    /// Serializes sets: at most one outstanding, FIFO.
    set_lock: Mutex<()>,
    cancel: CancellationToken,
}

impl Drop for DeviceInner {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// A Tuya-compatible device on the local network.
#[derive(Clone)]
pub struct Device {
    inner: Arc<DeviceInner>,
}

impl Device {
    pub fn id(&self) -> String {
        self.with_shared(|s| s.id.clone())
    }

    pub fn ip(&self) -> Option<String> {
        self.with_shared(|s| s.ip.clone())
    }

    pub fn version(&self) -> Version {
        self.with_shared(|s| s.version)
    }

    /// Product key reported by discovery, if any. Unused by the protocol.
    pub fn product_key(&self) -> Option<String> {
        self.with_shared(|s| s.product_key.clone())
    }

    pub fn is_connected(&self) -> bool {
        self.with_shared(|s| s.connected)
    }

    /// Open the connection (including the v3.4/v3.5 handshake).
    /// Resolves immediately when already connected.
    pub async fn connect(&self) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.send_command(SessionCommand::Connect { resp: tx }).await?;
        rx.await.map_err(|_| Error::Disconnected)?
    }

    /// Tear the connection down. Idempotent.
    pub async fn disconnect(&self) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.send_command(SessionCommand::Disconnect { resp: tx })
            .await?;
        rx.await.map_err(|_| Error::Disconnected)
    }

    /// Read device state.
    ///
    /// Returns the value of DP 1 by default, the requested DP with
    /// `dps`, or the whole DP map with `schema`.
    pub async fn get(&self, options: GetOptions) -> Result<Value> {
        let full = self.query_status(options.cid.as_deref()).await?;
        if options.schema {
            return Ok(full);
        }
        let dp = options.dps.unwrap_or(1);
        Ok(full
            .get("dps")
            .and_then(|dps| dps.get(dp.to_string()))
            .cloned()
            .unwrap_or(Value::Null))
    }

    /// Write device state and (by default) wait for the STATUS reply.
    pub async fn set(&self, options: SetOptions) -> Result<Value> {
        let dps_map = if options.multiple {
            options
                .data
                .ok_or_else(|| Error::Config("multiple set requires a data map".into()))?
        } else {
            let value = options
                .set
                .ok_or_else(|| Error::Config("set requires a value".into()))?;
            let mut map = Map::new();
            map.insert(options.dps.unwrap_or(1).to_string(), value);
            Value::Object(map)
        };

        let _serialized = self.inner.set_lock.lock().await;
        let version = self.version();
        let payload = self.control_payload(dps_map, options.cid.as_deref(), version);
        let command = if version.requires_handshake() {
            CommandType::ControlNew
        } else {
            CommandType::Control
        };
        let wait = if options.should_wait_for_response {
            WaitFor::Status
        } else {
            WaitFor::Nothing
        };
        self.send_request(command, payload, true, wait).await
    }

    /// Force silent DPs to report.
    pub async fn refresh(&self, options: RefreshOptions) -> Result<Value> {
        let version = self.version();
        if version == Version::V3_2 {
            return self.status_via_set_null(options.cid.as_deref()).await;
        }

        let dp_ids = options
            .dp_ids
            .unwrap_or_else(|| self.with_shared(|s| s.refresh_dps.clone()));
        let (id, gw_id) = self.with_shared(|s| (s.id.clone(), s.gw_id.clone()));
        let payload = refresh_payload_for(&id, &gw_id, &dp_ids);
        let reply = self
            .send_request(CommandType::DpRefresh, payload, true, WaitFor::Refresh)
            .await?;
        if is_quirk_reply(&reply) {
            return self.status_via_set_null(options.cid.as_deref()).await;
        }
        Ok(reply)
    }

    /// Flip a boolean DP and return its new value.
    pub async fn toggle(&self, dp: u32) -> Result<bool> {
        let current = self
            .get(GetOptions {
                dps: Some(dp),
                ..Default::default()
            })
            .await?;
        let current = current
            .as_bool()
            .ok_or_else(|| Error::Payload(format!("DP {dp} is not a boolean")))?;

        self.set(SetOptions {
            dps: Some(dp),
            set: Some(Value::Bool(!current)),
            ..Default::default()
        })
        .await?;

        let after = self
            .get(GetOptions {
                dps: Some(dp),
                ..Default::default()
            })
            .await?;
        after
            .as_bool()
            .ok_or_else(|| Error::Payload(format!("DP {dp} is not a boolean")))
    }

    /// Resolve the missing half of the device record (`ip` from `id` or
    /// the other way around) by listening for presence broadcasts.
    pub async fn find(&self) -> Result<DiscoveredDevice> {
        let (id, ip) = self.with_shared(|s| (s.id.clone(), s.ip.clone()));
        let listener = Discovery::new().with_timeout(self.inner.find_timeout);

        let found = if !id.is_empty() {
            listener.find(FindQuery::Id(&id), Some(&self.inner.key)).await?
        } else if let Some(ip) = ip.as_deref() {
            listener.find(FindQuery::Ip(ip), Some(&self.inner.key)).await?
        } else {
            return Err(Error::Config(
                "either a device id or an ip address is required".into(),
            ));
        };

        self.with_shared_mut(|s| {
            if s.id.is_empty() {
                s.id = found.id.clone();
            }
            if s.gw_id.is_empty() {
                s.gw_id = found.id.clone();
            }
            if s.ip.is_none() {
                s.ip = Some(found.ip.clone());
            }
            if let Some(version) = found.version
                && version != s.version
            {
                info!("broadcast advertises version {version}, re-seating");
                s.version = version;
            }
            if found.product_key.is_some() {
                s.product_key = found.product_key.clone();
            }
            if let Some(dps) = &found.dps {
                s.refresh_dps = discovery::refresh_indices(dps);
            }
        });
        Ok(found)
    }

    /// Subscribe to the device's event channel.
    pub fn subscribe(&self) -> broadcast::Receiver<DeviceEvent> {
        self.inner.events.subscribe()
    }

    /// Events as a `Stream`; lagged subscribers skip ahead.
    pub fn events(&self) -> impl Stream<Item = DeviceEvent> + Send + 'static {
        let mut rx = self.inner.events.subscribe();
        async_stream::stream! {
            loop {
                match rx.recv().await {
                    Ok(event) => yield event,
                    Err(broadcast::error::RecvError::Closed) => break,
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                }
            }
        }
    }

    // ---------------------------------------------------------------
    // Internals
    // ---------------------------------------------------------------

    async fn query_status(&self, cid: Option<&str>) -> Result<Value> {
        let version = self.version();
        if version == Version::V3_2 {
            // v3.2 firmwares reject DP_QUERY outright.
            return self.status_via_set_null(cid).await;
        }

        let command = if version.requires_handshake() {
            CommandType::DpQueryNew
        } else {
            CommandType::DpQuery
        };
        let (id, gw_id) = self.with_shared(|s| (s.id.clone(), s.gw_id.clone()));
        let payload = query_payload_for(&id, &gw_id, cid.or(self.inner.cid.as_deref()));
        let reply = self
            .send_request(command, payload, false, WaitFor::Reply)
            .await?;
        if is_quirk_reply(&reply) {
            debug!("quirky firmware reply, rerouting query through a null set");
            return self.status_via_set_null(cid).await;
        }
        Ok(reply)
    }

    /// A set carrying a null DP elicits the full status on firmwares
    /// that answer DP_QUERY with `"json obj data unvalid"`.
    async fn status_via_set_null(&self, cid: Option<&str>) -> Result<Value> {
        let _serialized = self.inner.set_lock.lock().await;
        let version = self.version();
        let payload = self.control_payload(json!({"1": null}), cid, version);
        let command = if version.requires_handshake() {
            CommandType::ControlNew
        } else {
            CommandType::Control
        };
        self.send_request(command, payload, true, WaitFor::Status)
            .await
    }

    fn control_payload(&self, dps: Value, cid: Option<&str>, version: Version) -> Value {
        let cid = cid.or(self.inner.cid.as_deref());
        let t = timestamp();
        if version.requires_handshake() {
            let mut data = Map::new();
            if let Some(c) = cid {
                data.insert("cid".into(), c.into());
            }
            data.insert("ctype".into(), 0.into());
            data.insert("dps".into(), dps);
            json!({"data": data, "protocol": 5, "t": t})
        } else {
            let (id, gw_id) = self.with_shared(|s| (s.id.clone(), s.gw_id.clone()));
            json!({
                "gwId": gw_id,
                "devId": cid.unwrap_or(id.as_str()),
                "t": t.to_string(),
                "dps": dps,
                "uid": id,
            })
        }
    }

    async fn send_request(
        &self,
        command: CommandType,
        payload: Value,
        encrypted: bool,
        wait: WaitFor,
    ) -> Result<Value> {
        let (tx, rx) = oneshot::channel();
        self.send_command(SessionCommand::Send(Box::new(SendRequest {
            command,
            payload,
            encrypted,
            wait,
            attempts: 0,
            resp: Some(tx),
        })))
        .await?;
        rx.await.map_err(|_| Error::Disconnected)?
    }

    async fn send_command(&self, command: SessionCommand) -> Result<()> {
        self.inner
            .tx
            .send(command)
            .await
            .map_err(|_| Error::Disconnected)
    }

    fn with_shared<R>(&self, f: impl FnOnce(&SharedState) -> R) -> R {
        f(&self.inner.shared.read().expect("state lock poisoned"))
    }

    fn with_shared_mut<R>(&self, f: impl FnOnce(&mut SharedState) -> R) -> R {
        f(&mut self.inner.shared.write().expect("state lock poisoned"))
    }
}

fn is_quirk_reply(value: &Value) -> bool {
    value
        .as_str()
        .is_some_and(|s| s.contains("json obj data unvalid") || s.contains("data format error"))
}

pub(crate) fn timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// `{gwId, devId, t, dps:{}, uid}` query body.
pub(crate) fn query_payload_for(id: &str, gw_id: &str, cid: Option<&str>) -> Value {
    json!({
        "gwId": gw_id,
        "devId": cid.unwrap_or(id),
        "t": timestamp().to_string(),
        "dps": {},
        "uid": id,
    })
}

/// `{gwId, devId, t, dpId, uid}` refresh body.
pub(crate) fn refresh_payload_for(id: &str, gw_id: &str, dp_ids: &[u32]) -> Value {
    json!({
        "gwId": gw_id,
        "devId": id,
        "t": timestamp().to_string(),
        "dpId": dp_ids,
        "uid": id,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const ID: &str = "22325186db4a2217dc8e";
    const KEY: &str = "4226aa407d5c1e2b";

    #[test]
    fn construction_rejects_bad_configs() {
        assert!(matches!(
            DeviceBuilder::new().build(),
            Err(Error::Config(_))
        ));
        assert!(matches!(
            DeviceBuilder::new().id(ID).build(),
            Err(Error::Config(_))
        ));
        assert!(matches!(
            DeviceBuilder::new().ip("192.168.1.40").build(),
            Err(Error::Config(_))
        ));
        assert!(matches!(
            DeviceBuilder::new().id(ID).key("short-key-15-by").build(),
            Err(Error::Config(_))
        ));
    }

    #[tokio::test]
    async fn construction_accepts_id_or_ip() {
        let by_id = DeviceBuilder::new().id(ID).key(KEY).build().unwrap();
        assert_eq!(by_id.id(), ID);
        assert!(!by_id.is_connected());

        let by_ip = DeviceBuilder::new()
            .ip("192.168.1.40")
            .key(KEY)
            .build()
            .unwrap();
        assert_eq!(by_ip.ip().as_deref(), Some("192.168.1.40"));
    }

    #[tokio::test]
    async fn set_without_arguments_is_rejected() {
        let device = DeviceBuilder::new().id(ID).key(KEY).build().unwrap();
        assert!(matches!(
            device.set(SetOptions::default()).await,
            Err(Error::Config(_))
        ));
        assert!(matches!(
            device
                .set(SetOptions {
                    multiple: true,
                    ..Default::default()
                })
                .await,
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn query_payload_shape() {
        let payload = query_payload_for(ID, ID, None);
        assert_eq!(payload["gwId"], ID);
        assert_eq!(payload["devId"], ID);
        assert_eq!(payload["uid"], ID);
        assert_eq!(payload["dps"], json!({}));
        assert!(payload["t"].is_string());
    }

    #[tokio::test]
    async fn nested_control_payload_for_v34() {
        let device = DeviceBuilder::new()
            .id(ID)
            .key(KEY)
            .version(Version::V3_4)
            .build()
            .unwrap();
        let payload = device.control_payload(json!({"1": true}), None, Version::V3_4);
        assert_eq!(payload["protocol"], 5);
        assert_eq!(payload["data"]["ctype"], 0);
        assert_eq!(payload["data"]["dps"], json!({"1": true}));
        assert!(payload["t"].is_number());
    }

    #[test]
    fn quirk_literals_are_recognized() {
        assert!(is_quirk_reply(&json!("json obj data unvalid")));
        assert!(is_quirk_reply(&json!("data format error")));
        assert!(!is_quirk_reply(&json!({"dps": {"1": true}})));
    }
}
