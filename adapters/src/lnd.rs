//! LND-specific adapter implementation for Lightning Network node interactions.
//!
//! This file contains the complete concrete implementation of the `NodeAdapter` trait for LND,
//! including the connection description, the lazily authenticated REST client, the
//! streaming update reader, and the conversions from LND's wire shapes into the
//! crate's generic models.
//!
//! LND's REST gateway mirrors its gRPC service: 64-bit integers travel as strings,
//! byte fields as base64, and server streams as newline-delimited JSON objects of the
//! form `{"result": ...}` or `{"error": ...}`.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::{STANDARD, URL_SAFE};
use base64::Engine as _;
use chrono::{DateTime, Utc};
use reqwest::header::{HeaderMap, HeaderValue};
use reqwest::{Certificate, Client, RequestBuilder, Response};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::{mpsc, OnceCell};
use tracing::{debug, warn};

use crate::errors::AdapterError;
use crate::models::*;
use crate::rest::check_status;
use crate::utils::{self, de_id, de_i64, de_u64};
use crate::NodeAdapter;

const MACAROON_HEADER: &str = "Grpc-Metadata-macaroon";
const EVENT_BUFFER: usize = 64;
/// Subscriptions are long-lived; the per-request timeout only bounds unary calls.
const STREAM_TIMEOUT: Duration = Duration::from_secs(365 * 24 * 60 * 60);

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct LndConnection {
    /// `host:port` of the REST listener, with or without an `https://` prefix.
    pub address: String,
    pub macaroon: String,
    pub cert: String,
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

fn default_request_timeout() -> u64 {
    30
}

impl LndConnection {
    fn base_url(&self) -> String {
        let address = self.address.trim_end_matches('/');
        if address.starts_with("https://") || address.starts_with("http://") {
            address.to_string()
        } else {
            format!("https://{}", address)
        }
    }
}

pub struct LndAdapter {
    connection: LndConnection,
    base_url: String,
    client: OnceCell<Client>,
}

async fn reader(path: &str) -> Result<Vec<u8>, std::io::Error> {
    tokio::fs::read(path).await
}

impl LndAdapter {
    /// Creates the adapter without touching the network or the filesystem; the
    /// credentials are loaded on the first request.
    pub fn new(connection: LndConnection) -> Self {
        let base_url = connection.base_url();
        Self {
            connection,
            base_url,
            client: OnceCell::new(),
        }
    }

    async fn client(&self) -> Result<&Client, AdapterError> {
        self.client
            .get_or_try_init(|| async {
                let cert = reader(&self.connection.cert).await.map_err(|err| {
                    AdapterError::Transport(format!("Cannot load TLS certificate: {}", err))
                })?;
                let macaroon = reader(&self.connection.macaroon).await.map_err(|err| {
                    AdapterError::Auth(format!("Cannot load macaroon: {}", err))
                })?;

                let certificate = Certificate::from_pem(&cert).map_err(|err| {
                    AdapterError::Transport(format!("Invalid TLS certificate: {}", err))
                })?;
                let mut credential = HeaderValue::from_str(&hex::encode(macaroon))
                    .map_err(|err| AdapterError::Auth(format!("Invalid macaroon: {}", err)))?;
                credential.set_sensitive(true);
                let mut headers = HeaderMap::new();
                headers.insert(MACAROON_HEADER, credential);

                let client = Client::builder()
                    .add_root_certificate(certificate)
                    .tls_built_in_root_certs(false)
                    .default_headers(headers)
                    .timeout(Duration::from_secs(self.connection.request_timeout_secs))
                    .build()
                    .map_err(|err| {
                        AdapterError::Transport(format!("Cannot build LND client: {}", err))
                    })?;
                debug!("LND REST client ready for {}", self.base_url);
                Ok::<Client, AdapterError>(client)
            })
            .await
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn send(&self, request: RequestBuilder) -> Result<Response, AdapterError> {
        let response = request.send().await?;
        check_status(response).await
    }

    async fn get<T: DeserializeOwned>(&self, path: &str, query: &[(&str, String)]) -> Result<T, AdapterError> {
        let client = self.client().await?;
        let response = self.send(client.get(self.url(path)).query(query)).await?;
        Ok(response.json::<T>().await?)
    }

    async fn post<B: Serialize + ?Sized, T: DeserializeOwned>(&self, path: &str, body: &B) -> Result<T, AdapterError> {
        let client = self.client().await?;
        let response = self.send(client.post(self.url(path)).json(body)).await?;
        Ok(response.json::<T>().await?)
    }

    /// Opens a server stream and forwards each decoded `result` object to the
    /// returned receiver until the stream ends or the receiver is dropped.
    async fn subscribe<T, F>(&self, path: &str, decode: F) -> Result<mpsc::Receiver<T>, AdapterError>
    where
        T: Send + 'static,
        F: Fn(Value) -> Option<T> + Send + 'static,
    {
        let client = self.client().await?;
        let mut response = self
            .send(client.get(self.url(path)).timeout(STREAM_TIMEOUT))
            .await?;
        let (tx, rx) = mpsc::channel(EVENT_BUFFER);
        let path = path.to_string();

        tokio::spawn(async move {
            let mut lines = LineReader::default();
            loop {
                match lines.next(&mut response).await {
                    Ok(Some(result)) => {
                        if let Some(event) = decode(result) {
                            if tx.send(event).await.is_err() {
                                debug!("Subscriber for {} went away", path);
                                break;
                            }
                        }
                    }
                    Ok(None) => {
                        debug!("LND stream {} closed", path);
                        break;
                    }
                    Err(err) => {
                        warn!("LND stream {} failed: {}", path, err);
                        break;
                    }
                }
            }
        });

        Ok(rx)
    }

    /// Looks up the peer on the far side of one of our channels.
    async fn remote_pubkey_of(&self, channel_id: &str) -> Result<String, AdapterError> {
        self.list_channels(ChannelFilter::default())
            .await?
            .into_iter()
            .find(|c| c.channel_id == channel_id)
            .map(|c| c.remote_pubkey)
            .ok_or_else(|| AdapterError::NotFound(format!("channel {}", channel_id)))
    }
}

/// Splits a chunked response body into JSON lines and unwraps the gateway envelope.
#[derive(Default)]
struct LineReader {
    buffer: Vec<u8>,
}

impl LineReader {
    async fn next(&mut self, response: &mut Response) -> Result<Option<Value>, AdapterError> {
        loop {
            if let Some(value) = self.pop_line()? {
                return Ok(Some(value));
            }
            match response.chunk().await? {
                Some(chunk) => self.buffer.extend_from_slice(&chunk),
                None => {
                    let rest = std::mem::take(&mut self.buffer);
                    return decode_envelope(&rest);
                }
            }
        }
    }

    fn pop_line(&mut self) -> Result<Option<Value>, AdapterError> {
        while let Some(pos) = self.buffer.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=pos).collect();
            if let Some(value) = decode_envelope(&line)? {
                return Ok(Some(value));
            }
        }
        Ok(None)
    }
}

fn decode_envelope(line: &[u8]) -> Result<Option<Value>, AdapterError> {
    let text = String::from_utf8_lossy(line);
    let text = text.trim();
    if text.is_empty() {
        return Ok(None);
    }
    let mut envelope: Value = serde_json::from_str(text)?;
    if let Some(error) = envelope.get("error").filter(|e| !e.is_null()) {
        let message = error
            .get("message")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| error.to_string());
        return Err(AdapterError::Transport(message));
    }
    Ok(Some(envelope.get_mut("result").map(Value::take).unwrap_or(envelope)))
}

/// LND transmits transaction ids as little-endian base64 bytes; the
/// conventional display form is the reversed hex string.
fn txid_from_base64(encoded: &str) -> Option<String> {
    let mut bytes = STANDARD.decode(encoded).ok()?;
    bytes.reverse();
    Some(hex::encode(bytes))
}

fn hex_from_base64(encoded: &str) -> String {
    STANDARD
        .decode(encoded)
        .map(hex::encode)
        .unwrap_or_default()
}

fn timestamp(secs: i64) -> Option<DateTime<Utc>> {
    if secs <= 0 {
        return None;
    }
    DateTime::from_timestamp(secs, 0)
}

#[derive(Deserialize, Default)]
#[serde(default)]
struct LndChain {
    chain: String,
    network: String,
}

#[derive(Deserialize, Default)]
#[serde(default)]
struct LndFeature {
    name: String,
    is_required: bool,
    is_known: bool,
}

#[derive(Deserialize, Default)]
#[serde(default)]
struct LndGetInfo {
    identity_pubkey: String,
    alias: String,
    color: String,
    version: String,
    #[serde(deserialize_with = "de_u64")]
    num_active_channels: u64,
    #[serde(deserialize_with = "de_u64")]
    num_inactive_channels: u64,
    #[serde(deserialize_with = "de_u64")]
    num_pending_channels: u64,
    #[serde(deserialize_with = "de_u64")]
    block_height: u64,
    synced_to_chain: bool,
    synced_to_graph: bool,
    uris: Vec<String>,
    #[serde(deserialize_with = "de_i64")]
    best_header_timestamp: i64,
    chains: Vec<LndChain>,
    features: BTreeMap<String, LndFeature>,
}

impl From<LndGetInfo> for NodeInfo {
    fn from(info: LndGetInfo) -> Self {
        NodeInfo {
            pubkey: info.identity_pubkey,
            alias: info.alias,
            color: info.color,
            version: info.version,
            num_active_channels: info.num_active_channels as u32,
            num_inactive_channels: info.num_inactive_channels as u32,
            num_pending_channels: info.num_pending_channels as u32,
            block_height: info.block_height as u32,
            synced_to_chain: info.synced_to_chain,
            synced_to_graph: info.synced_to_graph,
            uris: info.uris,
            best_header_timestamp: timestamp(info.best_header_timestamp),
            chains: info
                .chains
                .into_iter()
                .map(|c| format!("{}:{}", c.chain, c.network))
                .collect(),
            features: info
                .features
                .into_iter()
                .filter_map(|(bit, f)| {
                    bit.parse::<u32>().ok().map(|bit| {
                        (
                            bit,
                            NodeFeature {
                                name: f.name,
                                is_required: f.is_required,
                                is_known: f.is_known,
                            },
                        )
                    })
                })
                .collect(),
        }
    }
}

#[derive(Deserialize, Default)]
#[serde(default)]
struct LndHtlc {
    incoming: bool,
    #[serde(deserialize_with = "de_u64")]
    amount: u64,
    hash_lock: String,
    #[serde(deserialize_with = "de_u64")]
    expiration_height: u64,
    #[serde(deserialize_with = "de_u64")]
    htlc_index: u64,
}

#[derive(Deserialize, Default)]
#[serde(default)]
struct LndChannel {
    active: bool,
    remote_pubkey: String,
    channel_point: String,
    #[serde(deserialize_with = "de_id")]
    chan_id: String,
    #[serde(deserialize_with = "de_u64")]
    capacity: u64,
    #[serde(deserialize_with = "de_u64")]
    local_balance: u64,
    #[serde(deserialize_with = "de_u64")]
    remote_balance: u64,
    #[serde(deserialize_with = "de_u64")]
    unsettled_balance: u64,
    #[serde(deserialize_with = "de_u64")]
    commit_fee: u64,
    #[serde(deserialize_with = "de_u64")]
    fee_per_kw: u64,
    #[serde(deserialize_with = "de_u64")]
    total_satoshis_sent: u64,
    #[serde(deserialize_with = "de_u64")]
    total_satoshis_received: u64,
    #[serde(deserialize_with = "de_u64")]
    num_updates: u64,
    pending_htlcs: Vec<LndHtlc>,
    private: bool,
    initiator: bool,
    #[serde(deserialize_with = "de_u64")]
    local_chan_reserve_sat: u64,
    #[serde(deserialize_with = "de_u64")]
    remote_chan_reserve_sat: u64,
}

impl From<LndChannel> for Channel {
    fn from(c: LndChannel) -> Self {
        Channel {
            channel_id: c.chan_id,
            channel_point: c.channel_point,
            remote_pubkey: c.remote_pubkey,
            capacity: c.capacity,
            local_balance: c.local_balance,
            remote_balance: c.remote_balance,
            unsettled_balance: c.unsettled_balance,
            active: c.active,
            private: c.private,
            initiator: c.initiator,
            total_satoshis_sent: c.total_satoshis_sent,
            total_satoshis_received: c.total_satoshis_received,
            num_updates: c.num_updates,
            commit_fee: c.commit_fee,
            fee_per_kw: c.fee_per_kw,
            local_chan_reserve_sat: c.local_chan_reserve_sat,
            remote_chan_reserve_sat: c.remote_chan_reserve_sat,
            pending_htlcs: c
                .pending_htlcs
                .into_iter()
                .map(|h| Htlc {
                    incoming: h.incoming,
                    amount: h.amount,
                    expiration_height: h.expiration_height as u32,
                    htlc_index: h.htlc_index,
                    hash_lock: hex_from_base64(&h.hash_lock),
                })
                .collect(),
        }
    }
}

#[derive(Deserialize, Default)]
#[serde(default)]
struct LndChannels {
    channels: Vec<LndChannel>,
}

#[derive(Deserialize, Default)]
#[serde(default)]
struct LndForwardingEvent {
    #[serde(deserialize_with = "de_i64")]
    timestamp: i64,
    #[serde(deserialize_with = "de_i64")]
    timestamp_ns: i64,
    #[serde(deserialize_with = "de_id")]
    chan_id_in: String,
    #[serde(deserialize_with = "de_id")]
    chan_id_out: String,
    #[serde(deserialize_with = "de_u64")]
    amt_in: u64,
    #[serde(deserialize_with = "de_u64")]
    amt_out: u64,
    #[serde(deserialize_with = "de_u64")]
    fee: u64,
    #[serde(deserialize_with = "de_u64")]
    fee_msat: u64,
    #[serde(deserialize_with = "de_u64")]
    amt_in_msat: u64,
    #[serde(deserialize_with = "de_u64")]
    amt_out_msat: u64,
}

impl LndForwardingEvent {
    fn occurred_at(&self) -> DateTime<Utc> {
        let precise = if self.timestamp_ns > 0 {
            DateTime::from_timestamp(
                self.timestamp_ns / 1_000_000_000,
                (self.timestamp_ns % 1_000_000_000) as u32,
            )
        } else {
            None
        };
        precise
            .or_else(|| DateTime::from_timestamp(self.timestamp, 0))
            .unwrap_or_default()
    }
}

#[derive(Deserialize, Default)]
#[serde(default)]
struct LndForwardingHistory {
    forwarding_events: Vec<LndForwardingEvent>,
    #[serde(deserialize_with = "de_u64")]
    last_offset_index: u64,
}

#[derive(Deserialize, Default)]
#[serde(default)]
struct LndChannelPoint {
    funding_txid_bytes: String,
    funding_txid_str: String,
    #[serde(deserialize_with = "de_u64")]
    output_index: u64,
}

impl LndChannelPoint {
    fn into_model(self) -> Result<ChannelPoint, AdapterError> {
        let funding_txid = if !self.funding_txid_str.is_empty() {
            self.funding_txid_str
        } else {
            txid_from_base64(&self.funding_txid_bytes).ok_or_else(|| {
                AdapterError::Parse("channel point without a funding txid".to_string())
            })?
        };
        Ok(ChannelPoint {
            funding_txid,
            output_index: self.output_index as u32,
        })
    }

    fn display(value: &Value) -> String {
        serde_json::from_value::<LndChannelPoint>(value.clone())
            .ok()
            .and_then(|p| p.into_model().ok())
            .map(|p| p.to_string())
            .unwrap_or_default()
    }
}

#[derive(Deserialize, Default)]
#[serde(default)]
struct LndPolicyUpdateResponse {
    failed_updates: Vec<Value>,
}

#[derive(Deserialize, Default)]
#[serde(default)]
struct LndAddInvoiceResponse {
    r_hash: String,
    payment_request: String,
    payment_addr: String,
}

#[derive(Deserialize, Default)]
#[serde(default)]
struct LndHop {
    #[serde(deserialize_with = "de_id")]
    chan_id: String,
    pub_key: String,
    #[serde(deserialize_with = "de_u64")]
    amt_to_forward: u64,
    #[serde(deserialize_with = "de_u64")]
    fee: u64,
    #[serde(deserialize_with = "de_u64")]
    expiry: u64,
}

#[derive(Deserialize, Default)]
#[serde(default)]
struct LndRoute {
    #[serde(deserialize_with = "de_u64")]
    total_fees: u64,
    #[serde(deserialize_with = "de_u64")]
    total_amt: u64,
    hops: Vec<LndHop>,
}

#[derive(Deserialize, Default)]
#[serde(default)]
struct LndQueryRoutesResponse {
    routes: Vec<Value>,
}

#[derive(Deserialize, Default)]
#[serde(default)]
struct LndFailure {
    code: String,
}

/// Result of one `SendToRoute` attempt.
#[derive(Deserialize, Default)]
#[serde(default)]
struct LndHtlcAttempt {
    status: String,
    route: Option<LndRoute>,
    preimage: String,
    failure: Option<LndFailure>,
}

impl From<LndHtlcAttempt> for RebalanceOutcome {
    fn from(attempt: LndHtlcAttempt) -> Self {
        let route = attempt.route.unwrap_or_default();
        let success = attempt.status == "SUCCEEDED";
        let error = (!success).then(|| match attempt.failure {
            Some(failure) if !failure.code.is_empty() => failure.code,
            _ => format!("htlc attempt {}", attempt.status.to_lowercase()),
        });
        RebalanceOutcome {
            success,
            preimage: (success && !attempt.preimage.is_empty()).then(|| hex_from_base64(&attempt.preimage)),
            error,
            total_fees: route.total_fees,
            total_amt: route.total_amt,
            hops: route
                .hops
                .into_iter()
                .map(|h| RouteHop {
                    chan_id: h.chan_id,
                    pub_key: h.pub_key,
                    amt_to_forward: h.amt_to_forward,
                    fee: h.fee,
                    expiry: h.expiry as u32,
                })
                .collect(),
        }
    }
}

/// `QueryRoutes` back to ourselves, leaving through `source` and arriving
/// from `last_hop`. Byte query parameters are URL-safe base64.
fn circular_route_query(
    own_pubkey: &str,
    amount_sat: u64,
    source: &str,
    last_hop: &[u8],
    fee_limit_sat: u64,
) -> (String, Vec<(&'static str, String)>) {
    (
        format!("/v1/graph/routes/{}/{}", own_pubkey, amount_sat),
        vec![
            ("outgoing_chan_id", source.to_string()),
            ("last_hop_pubkey", URL_SAFE.encode(last_hop)),
            ("fee_limit.fixed", fee_limit_sat.to_string()),
            ("use_mission_control", "true".to_string()),
        ],
    )
}

/// Puts the invoice's payment address on the final hop so the node accepts
/// the payment as its own invoice.
fn with_payment_addr(mut route: Value, payment_addr: &str, amount_sat: u64) -> Result<Value, AdapterError> {
    let last = route
        .get_mut("hops")
        .and_then(Value::as_array_mut)
        .and_then(|hops| hops.last_mut())
        .ok_or_else(|| AdapterError::Parse("route without hops".to_string()))?;
    last["mpp_record"] = json!({
        "payment_addr": payment_addr,
        "total_amt_msat": (amount_sat * 1000).to_string(),
    });
    Ok(route)
}

fn decode_channel_event(update: Value) -> Option<ChannelEvent> {
    let kind = update.get("type").and_then(Value::as_str).unwrap_or_default();
    match kind {
        "OPEN_CHANNEL" => {
            let channel: LndChannel = serde_json::from_value(update.get("open_channel")?.clone()).ok()?;
            Some(ChannelEvent::Opened {
                channel_id: channel.chan_id,
                remote_pubkey: channel.remote_pubkey,
                capacity: channel.capacity,
            })
        }
        "CLOSED_CHANNEL" => {
            let closed = update.get("closed_channel")?;
            Some(ChannelEvent::Closed {
                channel_id: utils::value_id(closed, "chan_id").unwrap_or_default(),
                remote_pubkey: utils::value_str(closed, "remote_pubkey").unwrap_or_default(),
                capacity: utils::value_u64(closed, "capacity").unwrap_or_default(),
                close_type: utils::value_str(closed, "close_type").unwrap_or_default(),
            })
        }
        "ACTIVE_CHANNEL" => Some(ChannelEvent::Active {
            channel_point: LndChannelPoint::display(update.get("active_channel")?),
        }),
        "INACTIVE_CHANNEL" => Some(ChannelEvent::Inactive {
            channel_point: LndChannelPoint::display(update.get("inactive_channel")?),
        }),
        "PENDING_OPEN_CHANNEL" => {
            let pending = update.get("pending_open_channel")?;
            Some(ChannelEvent::PendingOpen {
                txid: utils::value_str(pending, "txid")
                    .and_then(|t| txid_from_base64(&t))
                    .unwrap_or_default(),
                output_index: utils::value_u64(pending, "output_index").unwrap_or_default() as u32,
            })
        }
        other => {
            debug!("Ignoring channel event of type {:?}", other);
            None
        }
    }
}

fn decode_invoice(invoice: Value) -> Option<InvoiceEvent> {
    let state = utils::value_str(&invoice, "state").unwrap_or_else(|| "OPEN".to_string());
    Some(InvoiceEvent {
        memo: utils::value_str(&invoice, "memo").unwrap_or_default(),
        r_hash: hex_from_base64(&utils::value_str(&invoice, "r_hash").unwrap_or_default()),
        value: utils::value_u64(&invoice, "value").unwrap_or_default(),
        settled: invoice
            .get("settled")
            .and_then(Value::as_bool)
            .unwrap_or(state == "SETTLED"),
        state,
        amt_paid_sat: utils::value_u64(&invoice, "amt_paid_sat").unwrap_or_default(),
        creation_date: timestamp(utils::value_u64(&invoice, "creation_date").unwrap_or_default() as i64),
        settle_date: timestamp(utils::value_u64(&invoice, "settle_date").unwrap_or_default() as i64),
        payment_request: utils::value_str(&invoice, "payment_request").unwrap_or_default(),
    })
}

#[async_trait]
impl NodeAdapter for LndAdapter {
    fn endpoint(&self) -> String {
        self.base_url.clone()
    }

    async fn get_info(&self) -> Result<NodeInfo, AdapterError> {
        let info: LndGetInfo = self.get("/v1/getinfo", &[]).await?;
        Ok(info.into())
    }

    async fn list_channels(&self, filter: ChannelFilter) -> Result<Vec<Channel>, AdapterError> {
        filter.validate()?;
        let mut query = Vec::new();
        if filter.active_only {
            query.push(("active_only", "true".to_string()));
        }
        if filter.inactive_only {
            query.push(("inactive_only", "true".to_string()));
        }
        let response: LndChannels = self.get("/v1/channels", &query).await?;
        Ok(response.channels.into_iter().map(Channel::from).collect())
    }

    async fn forwarding_history(&self, query: &ForwardingQuery) -> Result<ForwardingHistory, AdapterError> {
        query.validate()?;
        let body = json!({
            "start_time": query.start_time.timestamp().to_string(),
            "end_time": query.end_time.timestamp().to_string(),
            "index_offset": query.offset,
            "num_max_events": query.limit,
        });
        let response: LndForwardingHistory = self.post("/v1/switch", &body).await?;
        Ok(ForwardingHistory {
            events: response
                .forwarding_events
                .into_iter()
                .map(|e| ForwardingEvent {
                    timestamp: e.occurred_at(),
                    chan_id_in: e.chan_id_in,
                    chan_id_out: e.chan_id_out,
                    amt_in: e.amt_in,
                    amt_out: e.amt_out,
                    fee: e.fee,
                    fee_msat: e.fee_msat,
                    amt_in_msat: e.amt_in_msat,
                    amt_out_msat: e.amt_out_msat,
                })
                .collect(),
            last_offset_index: response.last_offset_index as u32,
        })
    }

    async fn open_channel(&self, request: &OpenChannelRequest) -> Result<ChannelPoint, AdapterError> {
        request.validate()?;
        let pubkey = utils::parse_node_id(&request.node_pubkey)?;
        let body = json!({
            "node_pubkey": STANDARD.encode(pubkey.serialize()),
            "local_funding_amount": request.local_funding_amount.to_string(),
            "push_sat": request.push_sat.to_string(),
            "private": request.private,
            "min_htlc_msat": request.min_htlc_msat.to_string(),
            "remote_csv_delay": request.remote_csv_delay,
            "spend_unconfirmed": request.spend_unconfirmed,
        });
        let point: LndChannelPoint = self.post("/v1/channels", &body).await?;
        point.into_model()
    }

    async fn close_channel(
        &self,
        channel_point: &ChannelPoint,
        force: bool,
        target_conf: u32,
    ) -> Result<Option<String>, AdapterError> {
        let client = self.client().await?;
        let path = format!(
            "/v1/channels/{}/{}",
            channel_point.funding_txid, channel_point.output_index
        );
        let mut query = vec![("force", force.to_string())];
        if !force {
            query.push(("target_conf", target_conf.to_string()));
        }
        let mut response = self.send(client.delete(self.url(&path)).query(&query)).await?;

        let mut lines = LineReader::default();
        while let Some(update) = lines.next(&mut response).await? {
            if let Some(pending) = update.get("close_pending") {
                let txid = utils::value_str(pending, "txid").and_then(|t| txid_from_base64(&t));
                debug!("Close of {} pending: {:?}", channel_point, txid);
                return Ok(txid);
            }
            if let Some(closed) = update.get("chan_close") {
                return Ok(utils::value_str(closed, "closing_txid").and_then(|t| txid_from_base64(&t)));
            }
        }
        Ok(None)
    }

    async fn update_channel_policy(&self, update: &PolicyUpdate) -> Result<(), AdapterError> {
        update.validate()?;
        let mut body = json!({
            "chan_point": {
                "funding_txid_str": update.channel_point.funding_txid,
                "output_index": update.channel_point.output_index,
            },
        });
        if let Some(base_fee) = update.base_fee_msat {
            body["base_fee_msat"] = json!(base_fee.to_string());
        }
        if let Some(ppm) = update.fee_rate_ppm {
            body["fee_rate_ppm"] = json!(ppm);
        }
        if let Some(delta) = update.time_lock_delta {
            body["time_lock_delta"] = json!(delta);
        }
        let response: LndPolicyUpdateResponse = self.post("/v1/chanpolicy", &body).await?;
        if let Some(failure) = response.failed_updates.first() {
            return Err(AdapterError::Validation(format!(
                "node rejected policy update for {}: {}",
                update.channel_point,
                utils::value_str(failure, "update_error").unwrap_or_else(|| failure.to_string())
            )));
        }
        Ok(())
    }

    async fn rebalance(&self, request: &RebalanceRequest) -> Result<RebalanceOutcome, AdapterError> {
        request.validate()?;
        let own_pubkey = self.get_info().await?.pubkey;
        let invoice: LndAddInvoiceResponse = self
            .post(
                "/v1/invoices",
                &json!({
                    "memo": "rebalance",
                    "value": request.amount_sat.to_string(),
                    "expiry": "600",
                }),
            )
            .await?;
        debug!("Created rebalance invoice {}", hex_from_base64(&invoice.r_hash));

        let mut last = RebalanceOutcome::default();
        for target in &request.target_channels {
            let last_hop = utils::parse_node_id(&self.remote_pubkey_of(target).await?)?;
            for source in &request.source_channels {
                let (path, query) = circular_route_query(
                    &own_pubkey,
                    request.amount_sat,
                    source,
                    &last_hop.serialize(),
                    request.fee_limit_sat,
                );
                let routes: LndQueryRoutesResponse = match self.get(&path, &query).await {
                    Ok(routes) => routes,
                    // LND answers "unable to find a path" with an error status
                    Err(err @ (AdapterError::Http { .. } | AdapterError::NotFound(_))) => {
                        debug!("No route {} -> {}: {}", source, target, err);
                        last = RebalanceOutcome {
                            error: Some(err.to_string()),
                            ..Default::default()
                        };
                        continue;
                    }
                    Err(err) => return Err(err),
                };
                let Some(route) = routes.routes.into_iter().next() else {
                    continue;
                };
                let route = with_payment_addr(route, &invoice.payment_addr, request.amount_sat)?;
                let attempt: LndHtlcAttempt = self
                    .post(
                        "/v2/router/route/send",
                        &json!({ "payment_hash": invoice.r_hash, "route": route }),
                    )
                    .await?;
                last = attempt.into();
                if last.success {
                    return Ok(last);
                }
                debug!(
                    "Rebalance attempt {} -> {} failed: {:?}",
                    source, target, last.error
                );
            }
        }
        if last.error.is_none() {
            last.error = Some("no circular route found".to_string());
        }
        Ok(last)
    }

    async fn subscribe_channel_events(&self) -> Result<mpsc::Receiver<ChannelEvent>, AdapterError> {
        self.subscribe("/v1/channels/subscribe", decode_channel_event).await
    }

    async fn subscribe_invoices(&self) -> Result<mpsc::Receiver<InvoiceEvent>, AdapterError> {
        self.subscribe("/v1/invoices/subscribe", decode_invoice).await
    }
}
