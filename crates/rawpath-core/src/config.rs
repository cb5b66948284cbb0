//! Datapath knobs: a TOML file plus a few `RAWPATH_*` overrides.
//!
//! The file is `$RAWPATH_CONFIG` if set, else
//! `$XDG_CONFIG_HOME/rawpath/config.toml` (`~/.config` when XDG is unset).
//! Keys missing from the file keep their defaults; a set override beats both.
//!
//! The file only carries knobs. `RawpathConfig::geometry()` validates them
//! and derives the fixed sizes the datapath is built with.

use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;
use std::path::PathBuf;

use crate::wire::PKTHDR_SIZE;

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RawpathConfig {
    pub tx: TxConfig,
    pub rx: RxConfig,
    pub loopback: LoopbackConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TxConfig {
    /// Max descriptors per batched post, on both send and receive.
    pub postlist: usize,
    /// Inline-data budget of the NIC in bytes. 0 = never inline.
    pub max_inline: usize,
    /// Request a send completion for every Nth descriptor.
    pub signal_every: usize,
    /// Honour per-item drop flags. Test deployments only.
    pub testing: bool,
}

/// How the receive path learns about arrivals.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecvMode {
    /// Multi-packet receive queue; arrivals are read off NIC-written
    /// completion snapshots.
    MultiPacket,
    /// One receive descriptor per buffer; arrivals are polled from the
    /// completion queue.
    CompletionQueue,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RxConfig {
    pub mode: RecvMode,
    /// log2 of strides (packet slots) per multi-packet receive WQE.
    pub log_num_strides: u32,
    /// log2 of the stride size. The stride is the receive slot size and
    /// therefore the MTU.
    pub log_stride_bytes: u32,
    /// Multi-packet receive WQEs in the receive queue.
    pub mp_rq_depth: usize,
    /// Completion entries the NIC cycles through in multi-packet mode.
    pub recv_cq_depth: usize,
    /// Receive slots in completion-queue mode.
    pub ring_entries: usize,
    /// Consumed receive buffers held back before a post, completion-queue mode.
    pub recv_slack: usize,
    /// Use the driver's bulk receive post when it supports one.
    pub fast_recv: bool,
}

/// Settings for the loopback daemon.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoopbackConfig {
    /// Local MAC, "xx:xx:xx:xx:xx:xx".
    pub mac: String,
    pub ip: Ipv4Addr,
    pub udp_port: u16,
    /// Payload bytes per generated message.
    pub msg_size: usize,
    /// Flag every Nth packet for drop injection. 0 = never.
    pub drop_every: usize,
}

// ── Defaults ──────────────────────────────────────────────────────────────────

impl Default for TxConfig {
    fn default() -> Self {
        Self {
            postlist: 64,
            max_inline: 60,
            signal_every: 64,
            testing: false,
        }
    }
}

impl Default for RxConfig {
    fn default() -> Self {
        Self {
            mode: RecvMode::MultiPacket,
            log_num_strides: 9,
            log_stride_bytes: 10,
            mp_rq_depth: 4,
            recv_cq_depth: 8,
            ring_entries: 2048,
            recv_slack: 32,
            fast_recv: true,
        }
    }
}

impl Default for LoopbackConfig {
    fn default() -> Self {
        Self {
            mac: "02:00:00:00:00:01".to_string(),
            ip: Ipv4Addr::new(10, 10, 0, 1),
            udp_port: 31850,
            msg_size: 3000,
            drop_every: 0,
        }
    }
}

// ── Derived geometry ──────────────────────────────────────────────────────────

/// Validated, derived sizes the datapath is constructed with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DatapathGeometry {
    pub mode: RecvMode,
    /// Receive slot size; also the largest frame the datapath emits.
    pub mtu: usize,
    /// Payload bytes carried by one packet.
    pub max_data_per_pkt: usize,
    pub postlist: usize,
    pub max_inline: usize,
    pub signal_every: usize,
    pub testing: bool,
    pub strides_per_wqe: usize,
    pub mp_rq_depth: usize,
    pub recv_cq_depth: usize,
    /// Receive slots in the ring, either mode.
    pub ring_entries: usize,
    pub recv_slack: usize,
    pub fast_recv: bool,
    /// Period of the (wqe_id, wqe_counter) snapshot index.
    pub cqe_snapshot_cycle: usize,
}

impl RawpathConfig {
    /// Validate the configuration and derive the datapath geometry.
    pub fn geometry(&self) -> Result<DatapathGeometry, ConfigError> {
        let tx = &self.tx;
        let rx = &self.rx;

        if tx.postlist == 0 {
            return Err(ConfigError::Invalid("tx.postlist must be at least 1".into()));
        }
        if tx.signal_every == 0 {
            return Err(ConfigError::Invalid("tx.signal_every must be at least 1".into()));
        }
        if !(6..=15).contains(&rx.log_stride_bytes) {
            return Err(ConfigError::Invalid(format!(
                "rx.log_stride_bytes {} outside 6..=15",
                rx.log_stride_bytes
            )));
        }
        if !(1..=16).contains(&rx.log_num_strides) {
            return Err(ConfigError::Invalid(format!(
                "rx.log_num_strides {} outside 1..=16",
                rx.log_num_strides
            )));
        }

        let mtu = 1usize << rx.log_stride_bytes;
        let strides_per_wqe = 1usize << rx.log_num_strides;

        let ring_entries = match rx.mode {
            RecvMode::MultiPacket => {
                if rx.mp_rq_depth == 0 || rx.mp_rq_depth >= 1 << 16 {
                    return Err(ConfigError::Invalid(
                        "rx.mp_rq_depth must be in 1..65536".into(),
                    ));
                }
                if rx.recv_cq_depth == 0 || rx.recv_cq_depth > strides_per_wqe {
                    return Err(ConfigError::Invalid(format!(
                        "rx.recv_cq_depth must be in 1..={strides_per_wqe}"
                    )));
                }
                rx.mp_rq_depth * strides_per_wqe
            }
            RecvMode::CompletionQueue => {
                if rx.ring_entries == 0 {
                    return Err(ConfigError::Invalid("rx.ring_entries must be at least 1".into()));
                }
                if rx.recv_slack == 0 || rx.recv_slack > rx.ring_entries {
                    return Err(ConfigError::Invalid(format!(
                        "rx.recv_slack must be in 1..={}",
                        rx.ring_entries
                    )));
                }
                rx.ring_entries
            }
        };

        if tx.postlist > ring_entries {
            return Err(ConfigError::Invalid(format!(
                "tx.postlist {} exceeds {ring_entries} receive slots",
                tx.postlist
            )));
        }

        Ok(DatapathGeometry {
            mode: rx.mode,
            mtu,
            max_data_per_pkt: mtu - PKTHDR_SIZE,
            postlist: tx.postlist,
            max_inline: tx.max_inline,
            signal_every: tx.signal_every,
            testing: tx.testing,
            strides_per_wqe,
            mp_rq_depth: rx.mp_rq_depth,
            recv_cq_depth: rx.recv_cq_depth,
            ring_entries,
            recv_slack: rx.recv_slack,
            fast_recv: rx.fast_recv,
            cqe_snapshot_cycle: (1 << 16) * strides_per_wqe,
        })
    }
}

impl LoopbackConfig {
    pub fn mac_bytes(&self) -> Result<[u8; 6], ConfigError> {
        parse_mac(&self.mac)
    }
}

fn parse_mac(s: &str) -> Result<[u8; 6], ConfigError> {
    let mut mac = [0u8; 6];
    let mut parts = s.split(':');
    for byte in mac.iter_mut() {
        let part = parts
            .next()
            .ok_or_else(|| ConfigError::Invalid(format!("bad MAC address: {s}")))?;
        *byte = u8::from_str_radix(part, 16)
            .map_err(|_| ConfigError::Invalid(format!("bad MAC address: {s}")))?;
    }
    if parts.next().is_some() {
        return Err(ConfigError::Invalid(format!("bad MAC address: {s}")));
    }
    Ok(mac)
}

// ── Path helpers ──────────────────────────────────────────────────────────────

fn config_dir() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home_dir().join(".config"))
        .join("rawpath")
}

fn home_dir() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp"))
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {0}: {1}")]
    ReadFailed(PathBuf, std::io::Error),
    #[error("failed to parse {0}: {1}")]
    ParseFailed(PathBuf, toml::de::Error),
    #[error("failed to write {0}: {1}")]
    WriteFailed(PathBuf, std::io::Error),
    #[error("failed to serialize: {0}")]
    SerializeFailed(toml::ser::Error),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

// ── Loading ───────────────────────────────────────────────────────────────────

impl RawpathConfig {
    /// Read the config file if there is one, fall back to defaults for
    /// anything it leaves out, then layer the `RAWPATH_*` variables on top.
    ///
    /// A malformed override is an error, not a silent no-op.
    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::file_path();
        let mut config = if path.exists() {
            let text = std::fs::read_to_string(&path)
                .map_err(|e| ConfigError::ReadFailed(path.clone(), e))?;
            toml::from_str(&text).map_err(|e| ConfigError::ParseFailed(path.clone(), e))?
        } else {
            RawpathConfig::default()
        };
        config.apply_env_overrides()?;
        Ok(config)
    }

    /// `$RAWPATH_CONFIG` when set, otherwise `config.toml` under the XDG
    /// config directory. The file need not exist.
    pub fn file_path() -> PathBuf {
        std::env::var("RAWPATH_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| config_dir().join("config.toml"))
    }

    /// Seed `file_path()` with the default knobs so an operator has
    /// something to edit. An existing file is left untouched.
    pub fn write_default_if_missing() -> Result<PathBuf, ConfigError> {
        let path = Self::file_path();
        if !path.exists() {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
            }
            let text = toml::to_string_pretty(&RawpathConfig::default())
                .map_err(ConfigError::SerializeFailed)?;
            std::fs::write(&path, text).map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
        }
        Ok(path)
    }

    /// Overrides recognised: `RAWPATH_RX__MODE`, `RAWPATH_RX__FAST_RECV`,
    /// `RAWPATH_TX__TESTING` and `RAWPATH_TX__POSTLIST`.
    fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        if let Some(v) = env_override("RAWPATH_RX__MODE") {
            self.rx.mode = match v.as_str() {
                "multi_packet" => RecvMode::MultiPacket,
                "completion_queue" => RecvMode::CompletionQueue,
                other => {
                    return Err(ConfigError::Invalid(format!(
                        "RAWPATH_RX__MODE: unknown receive mode {other:?}"
                    )))
                }
            };
        }
        if let Some(v) = env_override("RAWPATH_RX__FAST_RECV") {
            self.rx.fast_recv = parse_flag("RAWPATH_RX__FAST_RECV", &v)?;
        }
        if let Some(v) = env_override("RAWPATH_TX__TESTING") {
            self.tx.testing = parse_flag("RAWPATH_TX__TESTING", &v)?;
        }
        if let Some(v) = env_override("RAWPATH_TX__POSTLIST") {
            self.tx.postlist = v.parse().map_err(|_| {
                ConfigError::Invalid(format!("RAWPATH_TX__POSTLIST: not a count: {v:?}"))
            })?;
        }
        Ok(())
    }
}

fn env_override(name: &str) -> Option<String> {
    std::env::var(name).ok()
}

fn parse_flag(name: &str, v: &str) -> Result<bool, ConfigError> {
    match v {
        "true" | "1" => Ok(true),
        "false" | "0" => Ok(false),
        _ => Err(ConfigError::Invalid(format!("{name}: expected true/false/1/0, got {v:?}"))),
    }
}
