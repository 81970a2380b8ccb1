//! vbus simulator
//!
//! Drives one bus through its whole life against stand-in host devices:
//! start, attach configured and boot-probed disks, enumerate, run work on
//! the bus thread, then remove and shut down.

use std::fmt::Write as _;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{mpsc, Arc};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::Parser;
use log::{info, LevelFilter};

use vbus::bus::pnp::{IdType, RelationType, TextType};
use vbus::config::Config;
use vbus::device::{Completed, DeviceText};
use vbus::{
    logging, probe, Bus, BusNode, CustomWorkItem, DeviceHandle, DeviceObject, IoStatus, Irp,
    MajorFunction, PnpMinor, Reply,
};

/// How long to wait for the bus thread to answer
const REPLY_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Parser)]
#[command(name = "vbus")]
#[command(about = "Virtual bus simulator", long_about = None)]
struct Cli {
    /// Configuration file
    #[arg(short, long)]
    config: PathBuf,

    /// Low-memory image to probe for GRUB4DOS mappings (overrides config)
    #[arg(long)]
    probe_image: Option<PathBuf>,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,
}

// ============================================================================
// Host Stand-ins
// ============================================================================

/// The device below the bus; accepts whatever the bus sends down
#[derive(Debug, Default)]
struct HostStack;

impl DeviceObject for HostStack {
    fn name(&self) -> &str {
        "host-stack"
    }

    fn dispatch(&self, irp: &mut Irp) -> IoStatus {
        match irp.status() {
            IoStatus::NotSupported => IoStatus::Success,
            status => status,
        }
    }
}

/// The PDO the host enumerated the bus as
#[derive(Debug, Default)]
struct HostPdo {
    invalidations: AtomicUsize,
}

impl DeviceObject for HostPdo {
    fn name(&self) -> &str {
        "host-pdo"
    }

    fn invalidate_relations(&self) {
        self.invalidations.fetch_add(1, Ordering::Relaxed);
    }
}

fn bus_text(bus: &Bus, irp: &mut Irp) -> IoStatus {
    let mut text = DeviceText::new();
    let written = match irp.pnp_minor().and_then(PnpMinor::from_code) {
        Some(PnpMinor::QueryDeviceText) => match TextType::from_code(irp.parameter()) {
            Some(TextType::Description) => write!(text, "{} virtual disk bus", bus.name()),
            Some(TextType::LocationInformation) => write!(text, "{} root", bus.name()),
            None => return irp.status(),
        },
        Some(PnpMinor::QueryId) => match IdType::from_code(irp.parameter()) {
            Some(IdType::DeviceId | IdType::HardwareIds) => write!(text, "VBUS\\{}", bus.name()),
            Some(IdType::InstanceId) => write!(text, "0"),
            _ => return irp.status(),
        },
        _ => return irp.status(),
    };
    if written.is_err() {
        return IoStatus::InsufficientResources;
    }
    irp.set_reply(Reply::Text(text));
    IoStatus::Success
}

// ============================================================================
// Steps
// ============================================================================

/// Queue a request for the bus thread and wait for it to complete
fn forward(bus: &Bus, irp: Irp) -> Result<Completed> {
    let (irp, rx) = irp.with_channel();
    if let Err((err, irp)) = bus.enqueue_request(irp) {
        irp.complete(IoStatus::from(&err));
        bail!("bus refused request: {}", err);
    }
    rx.recv_timeout(REPLY_TIMEOUT)
        .context("bus thread did not complete the request")
}

fn pnp(bus: &Bus, minor: PnpMinor) -> Result<()> {
    let done = forward(bus, Irp::pnp(minor.code()))?;
    if !done.status.is_success() {
        bail!("{:?} failed: {:?}", minor, done.status);
    }
    Ok(())
}

fn attach_probed(bus: &Arc<Bus>, image: &Path) -> Result<Vec<Arc<BusNode>>> {
    let image = fs::read(image).with_context(|| format!("reading {}", image.display()))?;
    let mappings = probe::scan(&image);
    info!("probe found {} mapping(s)", mappings.len());
    let nodes = probe::attach(bus, &mappings, |m| -> DeviceHandle {
        Arc::new(m.to_disk(&format!("g4d{:02x}", m.source_drive)))
    })?;
    Ok(nodes)
}

/// Write a sector and read it back through the child, on the bus thread
fn exercise_child(bus: &Bus, child: DeviceHandle) -> Result<IoStatus> {
    let (tx, rx) = mpsc::channel();
    let item = CustomWorkItem::new(move || {
        let pattern = vec![0x5Au8; 512];
        let mut write = Irp::new(MajorFunction::Write { offset: 0 }).with_buffer(pattern.clone());
        let mut status = child.dispatch(&mut write);
        write.complete(status);

        if status == IoStatus::Success {
            let mut read = Irp::new(MajorFunction::Read { offset: 0, length: 512 });
            status = child.dispatch(&mut read);
            if status == IoStatus::Success && read.buffer() != pattern.as_slice() {
                status = IoStatus::Unsuccessful;
            }
            read.complete(status);
        }
        let _ = tx.send(status);
    });
    if let Err((err, _item)) = bus.enqueue_custom_work_item(item) {
        bail!("bus refused work item: {}", err);
    }
    rx.recv_timeout(REPLY_TIMEOUT)
        .context("bus thread did not run the work item")
}

fn run(cli: Cli) -> Result<()> {
    let config = Config::load(&cli.config)
        .with_context(|| format!("loading {}", cli.config.display()))?;

    let level = if cli.verbose {
        LevelFilter::Debug
    } else {
        config.log_level()?.unwrap_or(LevelFilter::Info)
    };
    logging::init(level).context("installing logger")?;

    let pdo = Arc::new(HostPdo::default());
    let bus = Arc::new(
        Bus::new()
            .with_name(&config.bus.name)
            .with_lower_device(Arc::new(HostStack))
            .with_pdo(pdo.clone())
            .with_query_dev_text(bus_text),
    );
    bus.start_thread()?;
    pnp(&bus, PnpMinor::StartDevice)?;

    for disk in &config.disks {
        let node = BusNode::new(Arc::new(disk.build()));
        let num = bus.add_node(&node)?;
        info!("disk {} attached as unit {}", disk.name, num);
    }
    let image = cli
        .probe_image
        .or_else(|| config.probe.as_ref().map(|p| p.image.clone()));
    if let Some(image) = image {
        attach_probed(&bus, &image)?;
    }

    let relations = forward(
        &bus,
        Irp::pnp(PnpMinor::QueryDeviceRelations.code()).with_parameter(RelationType::Bus as u32),
    )?;
    let children = relations.reply.relations().unwrap_or_default();
    println!("{}: {} child(ren)", bus.name(), children.len());
    for (node, device) in bus.nodes().zip(children) {
        println!("  unit {:>3}  {}", node.num(), device.name());
    }
    println!(
        "  relation refreshes sent to host: {}",
        pdo.invalidations.load(Ordering::Relaxed)
    );

    let description = forward(
        &bus,
        Irp::pnp(PnpMinor::QueryDeviceText.code()).with_parameter(TextType::Description as u32),
    )?;
    if let Reply::Text(text) = &description.reply {
        println!("  description: {}", text);
    }

    if let Some(first) = bus.next_node(None) {
        let status = exercise_child(&bus, first.pdo().clone())?;
        println!("  unit {} I/O check: {:?}", first.num(), status);
    }

    pnp(&bus, PnpMinor::QueryRemoveDevice)?;
    pnp(&bus, PnpMinor::RemoveDevice)?;
    bus.shutdown();
    println!("{}: {:?}", bus.name(), bus.state());
    Ok(())
}

fn main() -> Result<()> {
    run(Cli::parse())
}
