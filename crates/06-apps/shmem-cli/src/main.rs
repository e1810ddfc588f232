//! Command-line driver for the shared-memory link, running both processors
//! in-process over a loopback window.

use anyhow::{anyhow, bail, ensure, Context, Result};
use clap::{Parser, Subcommand};
use flash_tunnel::{FlashTunnelClient, FlashTunnelServer, MemFlash};
use hosted_framing::{BootupEvent, BootupInfo, Capabilities, FirmwareInfo, IfType, PacketType};
use net_channel::{NetChannel, NetChannelConfig};
use runtime_native::LoopbackLink;
use shmem_ipc::{IpcConfig, SubmitPolicy};
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing_subscriber::{fmt, EnvFilter};

/// Text rendering helpers used by the CLI commands.
mod render {
    use flash_tunnel::ServerStats;
    use hosted_framing::BootupEvent;
    use std::fmt::Write;

    /// Format a decoded bootup event.
    pub fn bootup(event: &BootupEvent) -> String {
        let info = &event.info;
        let chip = info.chip_id.map(|chip| format!("0x{chip:02X}"));
        let caps = info.capabilities.map(|caps| {
            let names: Vec<&str> = caps.iter_names().map(|(name, _)| name).collect();
            format!("0x{:02X} [{}]", caps.bits(), names.join(" "))
        });
        let raw_tp = info
            .raw_tp
            .map(|enabled| if enabled { "on" } else { "off" }.to_string());
        let firmware = info.firmware.map(|fw| {
            format!(
                "{}.{}.{} (last reset reason {})",
                fw.major1, fw.major2, fw.minor, fw.last_reset_reason
            )
        });

        let mut out = String::new();
        writeln!(out, "Bootup event (status {})", event.status).expect("write status");
        for (label, value) in [
            ("chip id:", chip),
            ("capabilities:", caps),
            ("raw throughput:", raw_tp),
            ("firmware:", firmware),
        ] {
            let value = value.unwrap_or_else(|| "-".to_string());
            writeln!(out, "  {label:<16}{value}").expect("write field");
        }
        if !info.unknown_tags.is_empty() {
            let tags: Vec<String> = info
                .unknown_tags
                .iter()
                .map(|tag| format!("0x{tag:02X}"))
                .collect();
            writeln!(out, "  {:<16}{}", "unknown tags:", tags.join(" ")).expect("write tags");
        }
        out
    }

    /// Format the result of a flash round trip.
    pub fn flash_report(addr: u32, len: usize, stats: &ServerStats) -> String {
        format!(
            "Flash 0x{addr:08X}+{len}: write, read back and erase verified\n\
             device: {} block(s) issued, {} command(s) run, {} failed, {} abandoned\n",
            stats.blocks_issued, stats.executed, stats.failed, stats.abandoned
        )
    }
}

/// Drive the shared-memory IPC link over an in-process loopback.
#[derive(Parser, Debug)]
#[command(author, version, about = "Exercise the shared-memory IPC link", long_about = None)]
struct Cli {
    /// JSON endpoint configuration; missing fields take their defaults.
    #[arg(short, long, value_name = "FILE", global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print the effective endpoint configuration.
    Config,
    /// Push frames device to host across all three lanes and report throughput.
    Bench {
        /// Number of frames to send.
        #[arg(short, long, default_value_t = 10_000)]
        frames: u32,
        /// Data bytes per frame.
        #[arg(short, long, default_value_t = 256)]
        payload: usize,
    },
    /// Write, read back and erase a flash range through the tunnel.
    Flash {
        /// Size of the simulated flash device (decimal or hex).
        #[arg(long, value_parser = parse_u32, default_value = "0x10000")]
        capacity: u32,
        /// Start address (decimal or hex).
        #[arg(value_parser = parse_u32, value_name = "ADDR")]
        addr: u32,
        /// Byte length (decimal or hex).
        #[arg(value_parser = parse_u32, value_name = "LEN")]
        len: u32,
    },
    /// Send a bootup event from the device and print what the host decodes.
    Bootup {
        /// Chip id (decimal or hex).
        #[arg(long, value_parser = parse_u8, default_value = "0x05")]
        chip_id: u8,
        /// Capability bits (decimal or hex).
        #[arg(long, value_parser = parse_u8, default_value = "0x21")]
        capabilities: u8,
        /// Firmware version as MAJOR1.MAJOR2.MINOR.
        #[arg(long, value_parser = parse_version, default_value = "1.0.0")]
        firmware: (u8, u8, u8),
        /// Last reset reason reported with the firmware version.
        #[arg(long, default_value_t = 0)]
        reset_reason: u32,
        /// Report raw-throughput test mode as enabled.
        #[arg(long)]
        raw_tp: bool,
    },
}

fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let config = load_config(cli.config.as_ref())?;

    match cli.command {
        Command::Config => println!("{}", config.to_json_pretty()),
        Command::Bench { frames, payload } => handle_bench(config, frames, payload)?,
        Command::Flash {
            capacity,
            addr,
            len,
        } => handle_flash(&config, capacity, addr, len as usize)?,
        Command::Bootup {
            chip_id,
            capabilities,
            firmware: (major1, major2, minor),
            reset_reason,
            raw_tp,
        } => {
            let info = BootupInfo {
                chip_id: Some(chip_id),
                capabilities: Some(Capabilities::from_bits_retain(capabilities)),
                raw_tp: Some(raw_tp),
                firmware: Some(FirmwareInfo {
                    major1,
                    major2,
                    minor,
                    last_reset_reason: reset_reason,
                }),
                ..BootupInfo::default()
            };
            handle_bootup(&config, info)?;
        }
    }

    Ok(())
}

fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));

    let _ = fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .try_init();
}

fn load_config(path: Option<&PathBuf>) -> Result<IpcConfig> {
    let Some(path) = path else {
        return Ok(IpcConfig::default());
    };
    let json =
        fs::read_to_string(path).with_context(|| format!("failed to read config {path:?}"))?;
    IpcConfig::from_json_str(&json).with_context(|| format!("invalid config {path:?}"))
}

const BENCH_INTERFACES: [IfType; 3] = [IfType::Sta, IfType::Hci, IfType::Internal];

fn handle_bench(mut config: IpcConfig, frames: u32, payload: usize) -> Result<()> {
    ensure!(frames > 0, "nothing to send");
    config.submit_policy = SubmitPolicy::Block;
    let link = LoopbackLink::new(&config)
        .context("failed to build loopback link")?
        .start()?;

    let device = NetChannel::attach(Arc::clone(link.device()), NetChannelConfig::default())?;
    let host = NetChannel::attach(
        Arc::clone(link.host()),
        NetChannelConfig {
            rx_lane_capacity: frames as usize,
            ..NetChannelConfig::default()
        },
    )?;

    let data = vec![0xA5; payload];
    let started = Instant::now();
    let per_lane = thread::scope(|scope| -> Result<[u64; 3]> {
        let reader = scope.spawn(|| -> Result<[u64; 3]> {
            let mut seen = [0u64; 3];
            for _ in 0..frames {
                let frame = host.read_timeout(Duration::from_secs(5))?;
                seen[frame.lane().index()] += 1;
            }
            Ok(seen)
        });
        for i in 0..frames as usize {
            let if_type = BENCH_INTERFACES[i % BENCH_INTERFACES.len()];
            device
                .write(if_type, 0, PacketType::Data, &data)
                .with_context(|| format!("failed to send frame {i}"))?;
        }
        reader.join().map_err(|_| anyhow!("reader thread panicked"))?
    })?;
    let elapsed = started.elapsed();

    let report = serde_json::json!({
        "frames": frames,
        "payload_bytes": payload,
        "elapsed_ms": elapsed.as_secs_f64() * 1000.0,
        "frames_per_sec": f64::from(frames) / elapsed.as_secs_f64().max(f64::EPSILON),
        "received_per_lane": { "high": per_lane[0], "mid": per_lane[1], "low": per_lane[2] },
        "device": { "ipc": link.device().metrics(), "net": device.stats() },
        "host": { "ipc": link.host().metrics(), "net": host.stats() },
    });
    println!("{}", serde_json::to_string_pretty(&report)?);

    drop(device);
    drop(host);
    link.shutdown();
    Ok(())
}

fn handle_flash(config: &IpcConfig, capacity: u32, addr: u32, len: usize) -> Result<()> {
    ensure!(len > 0, "nothing to write");
    let link = LoopbackLink::new(config).context("failed to build loopback link")?;
    let flash = Arc::new(MemFlash::new(capacity));
    let server = FlashTunnelServer::attach(link.device(), flash)?;
    let link = link.start()?;
    let client = FlashTunnelClient::connect(Arc::clone(link.host()), Duration::from_secs(2))
        .context("device never handed out a command block")?;

    let image: Vec<u8> = (0..len).map(|i| (i * 7 % 251) as u8).collect();
    client.write(addr, &image).context("flash write failed")?;
    let mut back = vec![0u8; len];
    client.read(addr, &mut back).context("flash read failed")?;
    if back != image {
        bail!("read back differs from what was written");
    }
    client.erase(addr, len as u32).context("flash erase failed")?;
    client.read(addr, &mut back).context("flash read failed")?;
    ensure!(back.iter().all(|&b| b == 0xFF), "erased range is not blank");

    print!("{}", render::flash_report(addr, len, &server.stats()));
    drop(client);
    link.shutdown();
    Ok(())
}

fn handle_bootup(config: &IpcConfig, info: BootupInfo) -> Result<()> {
    let link = LoopbackLink::new(config)
        .context("failed to build loopback link")?
        .start()?;
    let device = NetChannel::attach(Arc::clone(link.device()), NetChannelConfig::default())?;
    let host = NetChannel::attach(Arc::clone(link.host()), NetChannelConfig::default())?;

    device.send_bootup_event(info)?;
    let frame = host
        .read_timeout(Duration::from_secs(2))
        .context("no bootup event reached the host")?;
    if frame.if_type() != IfType::Internal {
        bail!("bootup arrived on {:?}", frame.if_type());
    }
    let event = BootupEvent::decode(&frame.data)?;
    print!("{}", render::bootup(&event));

    drop(device);
    drop(host);
    link.shutdown();
    Ok(())
}

fn parse_u8(input: &str) -> Result<u8, String> {
    let value = parse_u32(input)?;
    u8::try_from(value).map_err(|_| format!("'{input}' does not fit a byte"))
}

fn parse_u32(input: &str) -> Result<u32, String> {
    if let Some(stripped) = input.strip_prefix("0x") {
        u32::from_str_radix(stripped, 16).map_err(|_| format!("invalid hex value '{input}'"))
    } else {
        input
            .parse::<u32>()
            .map_err(|_| format!("invalid number '{input}'"))
    }
}

fn parse_version(input: &str) -> Result<(u8, u8, u8), String> {
    let parts: Vec<&str> = input.split('.').collect();
    let [major1, major2, minor] = parts.as_slice() else {
        return Err(format!("expected MAJOR1.MAJOR2.MINOR, got '{input}'"));
    };
    let field = |part: &str| {
        part.parse::<u8>()
            .map_err(|_| format!("invalid version component '{part}'"))
    };
    Ok((field(major1)?, field(major2)?, field(minor)?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use flash_tunnel::ServerStats;

    #[test]
    fn bootup_render_lists_every_field() {
        let mut info = BootupInfo {
            chip_id: Some(0x05),
            capabilities: Some(Capabilities::WLAN_SDIO | Capabilities::BT_UART),
            raw_tp: Some(false),
            firmware: Some(FirmwareInfo {
                major1: 1,
                major2: 2,
                minor: 3,
                last_reset_reason: 4,
            }),
            ..BootupInfo::default()
        };
        info.unknown_tags.push(0x7E);
        let text = render::bootup(&BootupEvent::new(info));
        assert_eq!(
            text,
            "Bootup event (status 0)\n\
             \x20 chip id:        0x05\n\
             \x20 capabilities:   0x03 [WLAN_SDIO BT_UART]\n\
             \x20 raw throughput: off\n\
             \x20 firmware:       1.2.3 (last reset reason 4)\n\
             \x20 unknown tags:   0x7E\n"
        );
    }

    #[test]
    fn bootup_render_marks_missing_fields() {
        let text = render::bootup(&BootupEvent::new(BootupInfo::default()));
        assert_eq!(text.matches(" -\n").count(), 4);
        assert!(!text.contains("unknown tags"));
    }

    #[test]
    fn flash_report_includes_device_counters() {
        let stats = ServerStats {
            blocks_issued: 1,
            executed: 3,
            failed: 0,
            abandoned: 0,
        };
        let text = render::flash_report(0x100, 16, &stats);
        assert!(text.starts_with("Flash 0x00000100+16"));
        assert!(text.contains("1 block(s) issued, 3 command(s) run"));
    }

    #[test]
    fn numbers_parse_as_decimal_or_hex() {
        assert_eq!(parse_u32("0x10"), Ok(16));
        assert_eq!(parse_u32("42"), Ok(42));
        assert!(parse_u32("0xZZ").is_err());
        assert_eq!(parse_u8("0xFF"), Ok(255));
        assert!(parse_u8("256").is_err());
    }

    #[test]
    fn versions_need_three_components() {
        assert_eq!(parse_version("1.2.3"), Ok((1, 2, 3)));
        assert!(parse_version("1.2").is_err());
        assert!(parse_version("1.2.300").is_err());
    }

    #[test]
    fn cli_definition_is_consistent() {
        use clap::CommandFactory;
        Cli::command().debug_assert();
    }
}
