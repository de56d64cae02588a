//! Device simulator speaking the channel wire format.
//!
//! A TCP test double for the imaging device: for every well-formed trigger
//! command it eventually produces exactly one reply, after an artificial
//! delay drawn from a configurable range, and with a configurable probability
//! substitutes a random non-success flag combination for the success path.
//! Malformed requests are answered (with the FatalUnknown flag) rather than
//! dropped, so the client side always sees its reply slot filled.
//!
//! This is what makes the bridge's failure paths (device error, protocol
//! error, timeout via a delay beyond the client timeout) exercisable without
//! real hardware.

use chrono::Utc;
use rand::Rng;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::BridgeResult;
use crate::protocol::{DeviceReply, ErrorFlags, TriggerCommand};

/// Knobs for the simulated device behavior.
#[derive(Debug, Clone)]
pub struct SimulatorConfig {
    /// Probability (0.0–1.0) of replying with a non-success flag set.
    pub error_rate: f64,
    /// Minimum artificial processing delay.
    pub delay_min: Duration,
    /// Maximum artificial processing delay.
    pub delay_max: Duration,
}

impl Default for SimulatorConfig {
    fn default() -> Self {
        Self {
            error_rate: 0.2,
            delay_min: Duration::from_millis(500),
            delay_max: Duration::from_millis(2_000),
        }
    }
}

impl SimulatorConfig {
    /// Instantaneous, always-successful device. Handy in tests.
    pub fn reliable() -> Self {
        Self {
            error_rate: 0.0,
            delay_min: Duration::ZERO,
            delay_max: Duration::ZERO,
        }
    }
}

/// Bound simulator, ready to serve connections.
pub struct DeviceSimulator {
    listener: TcpListener,
    config: SimulatorConfig,
}

impl DeviceSimulator {
    /// Bind to `addr` (use port 0 for an ephemeral test port).
    pub async fn bind(addr: &str, config: SimulatorConfig) -> BridgeResult<Self> {
        let listener = TcpListener::bind(addr).await?;
        info!(addr = %listener.local_addr()?, "Device simulator listening");
        Ok(Self { listener, config })
    }

    pub fn local_addr(&self) -> BridgeResult<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Serve connections forever.
    pub async fn run(self) -> BridgeResult<()> {
        loop {
            let (stream, peer) = self.listener.accept().await?;
            debug!(%peer, "Simulator accepted connection");
            let config = self.config.clone();
            tokio::spawn(async move {
                if let Err(e) = handle_connection(stream, config).await {
                    warn!(%peer, error = %e, "Simulator connection ended with error");
                }
            });
        }
    }

    /// Bind on an ephemeral localhost port and serve in a background task.
    /// Returns the endpoint string for a [`crate::channel::ChannelClient`].
    pub async fn spawn(config: SimulatorConfig) -> BridgeResult<(String, JoinHandle<()>)> {
        let simulator = Self::bind("127.0.0.1:0", config).await?;
        let endpoint = simulator.local_addr()?.to_string();
        let handle = tokio::spawn(async move {
            let _ = simulator.run().await;
        });
        Ok((endpoint, handle))
    }
}

async fn handle_connection(stream: TcpStream, config: SimulatorConfig) -> std::io::Result<()> {
    let (read_half, mut write_half) = stream.into_split();
    let mut lines = BufReader::new(read_half).lines();

    while let Some(line) = lines.next_line().await? {
        let reply = match TriggerCommand::decode(&line) {
            Ok(command) => synthesize_reply(&command, &config),
            Err(e) => {
                warn!(error = %e, "Simulator received malformed command");
                DeviceReply {
                    flags: ErrorFlags::FATAL_UNKNOWN,
                    plant_id: "unknown".to_string(),
                    image_directory: None,
                }
            }
        };

        let delay = pick_delay(&config);
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let mut line = reply.encode();
        line.push('\n');
        write_half.write_all(line.as_bytes()).await?;
        write_half.flush().await?;
    }
    Ok(())
}

fn pick_delay(config: &SimulatorConfig) -> Duration {
    if config.delay_max <= config.delay_min {
        return config.delay_min;
    }
    let span = (config.delay_max - config.delay_min).as_millis() as u64;
    let extra = rand::thread_rng().gen_range(0..=span);
    config.delay_min + Duration::from_millis(extra)
}

fn synthesize_reply(command: &TriggerCommand, config: &SimulatorConfig) -> DeviceReply {
    let mut rng = rand::thread_rng();
    if config.error_rate > 0.0 && rng.gen_bool(config.error_rate.clamp(0.0, 1.0)) {
        // Any non-zero combination of the eight device flags.
        let bits: u16 = rng.gen_range(1..=0xFF);
        debug!(plant_id = %command.plant_id, bits, "Simulator injecting error reply");
        return DeviceReply {
            flags: ErrorFlags::from_bits(bits),
            plant_id: command.plant_id.clone(),
            image_directory: None,
        };
    }

    let image_directory = Utc::now().format("ImageSet_%Y_%m_%d_%H_%M_%S").to_string();
    DeviceReply {
        flags: ErrorFlags::SUCCESS,
        plant_id: command.plant_id.clone(),
        image_directory: Some(image_directory),
    }
}
