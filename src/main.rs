// Copyright © 2025 The vfio-passthrough Authors
//
// SPDX-License-Identifier: Apache-2.0 OR BSD-3-Clause
//

//! Opens a passthrough device the way a VMM would, without any guest
//! memory, and reports what the host exposes for it.

use std::path::{Path, PathBuf};
use std::process;
use std::sync::Arc;

use anyhow::{anyhow, Context};
use clap::{Arg, ArgAction, Command};
use log::{info, LevelFilter};
use vfio_core::{LinuxVfioHost, VfioConfig, VfioRegistry};
use vm_device::{AddressSpaceId, MemorySection, MemoryTopology};

/// Address space without any section. Nothing gets DMA mapped.
struct EmptyAddressSpace;

impl MemoryTopology for EmptyAddressSpace {
    fn id(&self) -> AddressSpaceId {
        AddressSpaceId(0)
    }

    fn sections(&self) -> Vec<MemorySection> {
        Vec::new()
    }
}

fn create_app() -> Command {
    Command::new("vfio-passthrough")
        .version(env!("CARGO_PKG_VERSION"))
        .author(env!("CARGO_PKG_AUTHORS"))
        .about("Probe a VFIO passthrough device.")
        .arg_required_else_help(true)
        .arg(
            Arg::new("device")
                .long("device")
                .help("Sysfs path of the device, e.g. /sys/bus/pci/devices/0000:01:00.0")
                .num_args(1)
                .required(true),
        )
        .arg(
            Arg::new("config")
                .long("config")
                .help("JSON configuration file")
                .num_args(1),
        )
        .arg(
            Arg::new("no-mmap")
                .long("no-mmap")
                .help("Trap every region access instead of using direct mappings")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new("v")
                .short('v')
                .help("Sets the level of debugging output")
                .action(ArgAction::Count),
        )
}

fn load_config(path: Option<&String>) -> anyhow::Result<VfioConfig> {
    let Some(path) = path else {
        return Ok(VfioConfig::default());
    };
    let json = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read configuration {}", path))?;
    VfioConfig::from_json(&json).with_context(|| format!("Invalid configuration {}", path))
}

fn probe(sysfs_path: &Path, config: VfioConfig) -> anyhow::Result<()> {
    let name = sysfs_path
        .file_name()
        .and_then(|s| s.to_str())
        .ok_or_else(|| anyhow!("Invalid device path {}", sysfs_path.display()))?
        .to_owned();
    let group_id = LinuxVfioHost::group_id(sysfs_path)
        .with_context(|| format!("Failed to find IOMMU group of {}", name))?;

    info!(
        "KVM acceleration: intx {}, msi {}, msix {}",
        config.allow_kvm_intx, config.allow_kvm_msi, config.allow_kvm_msix
    );
    let registry = VfioRegistry::new(Arc::new(LinuxVfioHost::new()), config);
    let container = registry
        .get_group(group_id, Arc::new(EmptyAddressSpace))
        .with_context(|| format!("Failed to attach group {}", group_id))?;
    info!("Group {} attached to {}", group_id, container);

    let result = registry
        .open_device(group_id, &name, None)
        .with_context(|| format!("Failed to open {}", name))
        .and_then(|device| {
            let report = registry.with_device(device, |d| {
                println!(
                    "{}: {:?} device in group {}, {} regions, {} irqs, reset {}",
                    d.name(),
                    d.device_type(),
                    d.group_id(),
                    d.num_regions(),
                    d.num_irqs(),
                    if d.reset_works() { "supported" } else { "unsupported" }
                );
                for region in d.regions() {
                    println!(
                        "  region {}: size 0x{:x} flags {:?} {:?}",
                        region.index(),
                        region.size(),
                        region.flags(),
                        region.map_state()
                    );
                }
                for index in 0..d.num_irqs() {
                    if let Some(irq) = d.irq(index) {
                        println!("  irq {}: count {} flags {:?}", index, irq.count, irq.flags);
                    }
                }
                d.regions().iter().map(|r| r.index()).collect::<Vec<u32>>()
            });
            if let Ok(indices) = report.as_ref() {
                for index in indices.iter().copied() {
                    if let Ok(path) = registry.access_path(device, index, 0, 4) {
                        println!("  region {}: 32-bit access at 0 goes {:?}", index, path);
                    }
                }
            }
            registry
                .close_device(device)
                .with_context(|| format!("Failed to close {}", name))?;
            report.map(drop).map_err(anyhow::Error::from)
        });

    registry
        .put_group(group_id)
        .with_context(|| format!("Failed to release group {}", group_id))?;
    result
}

fn main() {
    let cmd_arguments = create_app().get_matches();

    let log_level = match cmd_arguments.get_count("v") {
        0 => LevelFilter::Warn,
        1 => LevelFilter::Info,
        2 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    };
    env_logger::Builder::from_default_env()
        .filter_level(log_level)
        .init();

    let mut config = match load_config(cmd_arguments.get_one::<String>("config")) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{:#}", e);
            process::exit(1);
        }
    };
    if cmd_arguments.get_flag("no-mmap") {
        config.allow_mmap = false;
    }

    let device = cmd_arguments
        .get_one::<String>("device")
        .map(PathBuf::from)
        .unwrap();
    if let Err(e) = probe(&device, config) {
        eprintln!("{:#}", e);
        process::exit(1);
    }
}
