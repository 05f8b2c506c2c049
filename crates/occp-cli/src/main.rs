//! `occp` — command-line interface for OCCP FPGA platforms.
//!
//! ```text
//! USAGE:
//!   occp search                      Find devices on PCI and Ethernet
//!   occp probe -d <dev>              Validate one device and print identity
//!   occp admin -d <dev>              Dump the admin register bank
//!   occp status -d <dev>             Control state of every present worker
//!   occp wdump -d <dev> <worker>     Dump one worker's control registers
//!   occp wop -d <dev> <worker> <op>  Perform a control operation
//!   occp settime -d <dev>            Set FPGA time from the host clock
//!   occp ethers                      List network interface candidates
//!   occp emulate <interface>         Answer the control protocol in software
//! ```
//!
//! The device name defaults to `$OCPI_DEFAULT_HDL_DEVICE`. Any error
//! reaching the top level is printed to stderr and exits with status 1.

use anyhow::{anyhow, bail, Context, Result};
use clap::{Parser, Subcommand};
use occp_chip::{admin, worker, OCCP_MAX_WORKERS};
use occp_driver::ether::RECV_BUF;
use occp_driver::sim::{SimDevice, SimSocket};
use occp_driver::{
    scan_interfaces, ControlOp, ControlSocket, Device, NetDriver, PciDriver, RawSocket,
    DEFAULT_DEVICE_ENV,
};
use std::time::Duration;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "occp", about = "OCCP FPGA platform CLI", version)]
struct Cli {
    /// Device name: PCI:<bdf>, Ether:<if>/<mac>, a bare BDF, or a bare
    /// MAC. Defaults to $OCPI_DEFAULT_HDL_DEVICE.
    #[arg(short, long, global = true)]
    device: Option<String>,

    #[command(subcommand)]
    command: Cmd,
}

#[derive(Subcommand)]
enum Cmd {
    /// Search PCI and Ethernet for HDL devices.
    Search {
        /// Restrict the Ethernet scan to one interface.
        #[arg(short, long)]
        interface: Option<String>,
        /// Device names to skip.
        #[arg(short, long)]
        exclude: Vec<String>,
    },
    /// Open one device, validate it, and print its identity.
    Probe,
    /// Dump the admin register bank.
    Admin,
    /// Print the control state of every present worker.
    Status,
    /// Dump one worker's control registers (without triggering anything).
    Wdump {
        /// OCCP worker index.
        worker: usize,
    },
    /// Hold a worker in reset.
    Wreset {
        /// OCCP worker index.
        worker: usize,
    },
    /// Take a worker out of reset.
    Wunreset {
        /// OCCP worker index.
        worker: usize,
    },
    /// Perform a control operation on a worker.
    Wop {
        /// OCCP worker index.
        worker: usize,
        /// One of initialize, start, stop, release, test, beforeQuery,
        /// afterConfigure.
        op: String,
    },
    /// Read 32-bit words from a worker's configuration space.
    Wread {
        /// OCCP worker index.
        worker: usize,
        /// Byte offset (decimal or 0x-prefixed hex).
        #[arg(value_parser = parse_num)]
        offset: u64,
        /// Number of words.
        #[arg(default_value = "1", value_parser = parse_num)]
        count: u64,
    },
    /// Write a 32-bit word into a worker's configuration space.
    Wwrite {
        /// OCCP worker index.
        worker: usize,
        /// Byte offset (decimal or 0x-prefixed hex).
        #[arg(value_parser = parse_num)]
        offset: u64,
        /// Value (decimal or 0x-prefixed hex).
        #[arg(value_parser = parse_num)]
        value: u64,
    },
    /// Set the FPGA time-of-day from the host clock.
    Settime,
    /// Measure the host to FPGA time offset.
    Deltatime,
    /// List network interfaces eligible for discovery.
    Ethers,
    /// Emulate an HDL device on a real interface, in software.
    Emulate {
        /// Interface to answer on.
        interface: String,
    },
}

fn parse_num(s: &str) -> std::result::Result<u64, String> {
    let t = s.trim();
    let parsed = match t.strip_prefix("0x").or_else(|| t.strip_prefix("0X")) {
        Some(h) => u64::from_str_radix(h, 16),
        None => t.parse(),
    };
    parsed.map_err(|_| format!("'{s}' is not a number"))
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| "warn".into()),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Cmd::Search { interface, exclude } => cmd_search(interface.as_deref(), &exclude)?,
        Cmd::Probe => cmd_probe(&open_device(cli.device)?)?,
        Cmd::Admin => cmd_admin(&open_device(cli.device)?)?,
        Cmd::Status => cmd_status(&open_device(cli.device)?)?,
        Cmd::Wdump { worker } => cmd_wdump(&open_device(cli.device)?, worker)?,
        Cmd::Wreset { worker } => cmd_reset(&open_device(cli.device)?, worker, true)?,
        Cmd::Wunreset { worker } => cmd_reset(&open_device(cli.device)?, worker, false)?,
        Cmd::Wop { worker, op } => cmd_wop(&open_device(cli.device)?, worker, &op)?,
        Cmd::Wread { worker, offset, count } => {
            cmd_wread(&open_device(cli.device)?, worker, offset, count)?;
        }
        Cmd::Wwrite { worker, offset, value } => {
            cmd_wwrite(&open_device(cli.device)?, worker, offset, value)?;
        }
        Cmd::Settime => cmd_settime(&open_device(cli.device)?)?,
        Cmd::Deltatime => cmd_deltatime(&open_device(cli.device)?)?,
        Cmd::Ethers => cmd_ethers()?,
        Cmd::Emulate { interface } => cmd_emulate(&interface)?,
    }

    Ok(())
}

/// Resolve the device name (argument, then environment) and open it with
/// whichever driver the name's shape selects.
fn open_device(name: Option<String>) -> Result<Device> {
    let name = match name.or_else(|| std::env::var(DEFAULT_DEVICE_ENV).ok()) {
        Some(n) => n,
        None => bail!("no device specified and {DEFAULT_DEVICE_ENV} is not set"),
    };
    let dev = if let Some(rest) = name.strip_prefix("PCI:") {
        PciDriver::new().open(rest)
    } else if let Some(rest) = name.strip_prefix("Ether:") {
        NetDriver::new().open(rest)
    } else if name.contains('/') || name.matches(':').count() == 5 {
        NetDriver::new().open(&name)
    } else {
        PciDriver::new().open(&name)
    };
    dev.with_context(|| format!("opening HDL device '{name}'"))
}

fn cmd_search(interface: Option<&str>, exclude: &[String]) -> Result<()> {
    let exclude: Vec<&str> = exclude.iter().map(String::as_str).collect();
    let mut count = 0;
    let mut print = |dev: Device| {
        count += 1;
        println!(
            "{:<28} platform {:<10} part {:<12} uuid {}",
            dev.name(),
            dev.platform(),
            dev.part(),
            dev.uuid().map_or_else(|| "-".into(), admin::HdlUuid::uuid_string),
        );
    };
    PciDriver::new().search(&exclude, &mut print);
    NetDriver::new().search(interface, &exclude, &mut print);
    println!("found {count} HDL device{}", if count == 1 { "" } else { "s" });
    Ok(())
}

fn cmd_probe(dev: &Device) -> Result<()> {
    println!("HDL device '{}' is alive", dev.name());
    println!("protocol : {}", dev.protocol());
    println!("platform : {}", dev.platform());
    println!("part     : {}", dev.part());
    if let Some(u) = dev.uuid() {
        println!("uuid     : {}", u.uuid_string());
    }
    if !dev.scratch_check()? {
        bail!("scratch register write/readback failed");
    }
    println!("scratch  : ok");
    Ok(())
}

fn cmd_admin(dev: &Device) -> Result<()> {
    let a = dev.control_space();
    let magic = a.get64(admin::MAGIC)?;
    println!("magic         : {magic:#018x} ({})", ascii_of(magic));
    println!("revision      : {}", a.get32(admin::REVISION)?);
    println!("birthday      : {}", a.get32(admin::BIRTHDAY)?);
    println!("config        : {:#018x}", a.get64(admin::CONFIG)?);
    println!("pciDevice     : {}", a.get32(admin::PCI_DEVICE)?);
    println!("attention     : {:#010x}", a.get32(admin::ATTENTION)?);
    println!("status        : {:#010x}", a.get32(admin::STATUS)?);
    println!("control       : {:#010x}", a.get32(admin::CONTROL)?);
    println!("scratch       : {:#010x} {:#010x}",
        a.get32(admin::SCRATCH20)?, a.get32(admin::SCRATCH24)?);
    println!("timeStatus    : {:#010x}", a.get32(admin::TIME_STATUS)?);
    println!("timeControl   : {:#010x}", a.get32(admin::TIME_CONTROL)?);
    let time = admin::swap32(a.get64(admin::TIME)?);
    println!("time          : {}.{:09}", time >> 32, frac_ns(time));
    println!("timeClksPerPps: {}", a.get32(admin::TIME_CLKS_PER_PPS)?);
    println!("dna           : {:#018x}", a.get64(admin::DNA)?);
    let n_regions = a.get32(admin::NUM_REGIONS)? as usize;
    println!("regions       : {n_regions}");
    for n in 0..n_regions.min(admin::N_REGION_SLOTS) {
        println!("  region {n}    : {:#010x}", a.get32(admin::REGIONS + n as u64 * 4)?);
    }
    if let Some(u) = dev.uuid() {
        println!("uuid          : {}", u.uuid_string());
        println!("  birthday    : {}", u.birthday);
        println!("  platform    : {}", u.platform_str().unwrap_or("-"));
        println!("  device      : {}", u.device_str().unwrap_or("-"));
    }
    Ok(())
}

fn cmd_status(dev: &Device) -> Result<()> {
    let present = dev.present_workers()?;
    for index in 0..OCCP_MAX_WORKERS {
        if present & (1u64 << index) == 0 {
            continue;
        }
        let mut w = dev.worker("worker", &format!("w{index}"), index)?;
        if w.is_reset()? {
            println!("worker {index:>2}: in reset");
            continue;
        }
        let state = w.attach()?;
        println!("worker {index:>2}: '{state}' (status {:#010x})", w.status()?);
    }
    Ok(())
}

fn cmd_wdump(dev: &Device, index: usize) -> Result<()> {
    // Never reads the op slots: those reads are command triggers.
    let w = dev.worker("worker", &format!("w{index}"), index)?;
    let c = w.control_access();
    let stat = c.get32(worker::STATUS)?;
    println!("worker {index} control registers:");
    println!("status     : {stat:#010x}{}", decode_status(stat));
    println!("control    : {:#010x}", c.get32(worker::CONTROL)?);
    println!("lastConfig : {:#010x}", c.get32(worker::LAST_CONFIG)?);
    println!("window     : {:#010x}", c.get32(worker::WINDOW)?);
    Ok(())
}

fn cmd_reset(dev: &Device, index: usize, assert: bool) -> Result<()> {
    let mut w = dev.worker("worker", &format!("w{index}"), index)?;
    if assert {
        w.assert_reset()?;
        println!("worker {index} held in reset");
    } else {
        w.reset_cycle()?;
        println!("worker {index} taken out of reset");
    }
    Ok(())
}

fn cmd_wop(dev: &Device, index: usize, op: &str) -> Result<()> {
    let op = ControlOp::from_name(op)
        .ok_or_else(|| anyhow!("unknown control operation '{op}'"))?;
    let mut w = dev.worker("worker", &format!("w{index}"), index)?;
    let was = w.attach()?;
    w.control_op(op)?;
    println!("worker {index}: '{op}' done (was '{was}', now '{}')", w.state());
    Ok(())
}

fn cmd_wread(dev: &Device, index: usize, offset: u64, count: u64) -> Result<()> {
    let mut w = dev.worker("worker", &format!("w{index}"), index)?;
    for n in 0..count {
        let at = offset + n * 4;
        println!("{at:#010x}: {:#010x}", w.config_read32(at)?);
    }
    Ok(())
}

fn cmd_wwrite(dev: &Device, index: usize, offset: u64, value: u64) -> Result<()> {
    let value = u32::try_from(value).context("value does not fit in 32 bits")?;
    let mut w = dev.worker("worker", &format!("w{index}"), index)?;
    w.config_write32(offset, value)?;
    println!("{offset:#010x} <- {value:#010x}");
    Ok(())
}

fn cmd_settime(dev: &Device) -> Result<()> {
    dev.set_time()?;
    println!("FPGA time set from the host clock");
    Ok(())
}

fn cmd_deltatime(dev: &Device) -> Result<()> {
    let ns = dev.delta_time()?;
    println!("host to FPGA round-trip corrected delta: {ns} ns");
    Ok(())
}

fn cmd_ethers() -> Result<()> {
    for ifc in scan_interfaces()? {
        println!(
            "{:<12} {}  {}, {}",
            ifc.name,
            ifc.mac,
            if ifc.up { "up" } else { "down" },
            if ifc.connected { "connected" } else { "not connected" },
        );
    }
    Ok(())
}

/// Serve the control protocol from an emulated register space, bridging a
/// raw socket on a real interface to the in-process device model.
fn cmd_emulate(if_name: &str) -> Result<()> {
    let ifc = scan_interfaces()?
        .into_iter()
        .find(|i| i.name == if_name)
        .ok_or_else(|| anyhow!("no such interface '{if_name}'"))?;
    let mut real = RawSocket::open(&ifc).context("raw sockets need CAP_NET_RAW")?;
    let mac = ifc.mac;
    let mut segment = SimSocket::new(mac);
    segment.add_device(mac, SimDevice::shared("sim_pf", "emulated"));
    println!("emulating an HDL device at {mac} on '{}'", ifc.name);

    let mut frame = [0u8; RECV_BUF];
    let mut resp = [0u8; RECV_BUF];
    loop {
        let Some((len, src)) = real.recv(&mut frame, Duration::from_secs(1))? else {
            continue;
        };
        segment.send(&frame[..len], mac)?;
        while let Some((n, _)) = segment.recv(&mut resp, Duration::ZERO)? {
            real.send(&resp[..n], src)?;
        }
    }
}

fn ascii_of(word: u64) -> String {
    word.to_be_bytes()
        .iter()
        .map(|&b| if b.is_ascii_graphic() { b as char } else { '.' })
        .collect()
}

fn frac_ns(ticks: u64) -> u64 {
    ((ticks & 0xffff_ffff) * 1_000_000_000) >> 32
}

fn decode_status(stat: u32) -> String {
    const BITS: [(u32, &str); 9] = [
        (worker::status::WRITE_TIMEOUT, "writeTimeout"),
        (worker::status::WRITE_FAIL, "writeFail"),
        (worker::status::WRITE_ERROR, "writeError"),
        (worker::status::READ_TIMEOUT, "readTimeout"),
        (worker::status::READ_FAIL, "readFail"),
        (worker::status::READ_ERROR, "readError"),
        (worker::status::ACCESS_ERROR, "accessError"),
        (worker::status::UNUSABLE, "unusable"),
        (worker::status::FINISHED, "finished"),
    ];
    let mut out = String::new();
    for (bit, name) in BITS {
        if stat & bit != 0 {
            out.push(' ');
            out.push_str(name);
        }
    }
    if let Some(op) = worker::status::last_op(stat) {
        out.push_str(&format!(" lastOp={op}"));
    }
    out
}
