//! `stockade validate`: Check a container spec.

use std::path::PathBuf;

use anyhow::Context;
use clap::Args;
use stockade_common::spec::ContainerSpec;
use stockade_core::cgroup::CgroupController;

use super::GlobalArgs;
use crate::output::format_bytes;

/// Arguments for the `validate` command.
#[derive(Args, Debug)]
pub struct ValidateArgs {
    /// Path to the container spec (YAML or JSON).
    pub spec: PathBuf,
}

/// Executes the `validate` command.
///
/// Checks the spec structure and its resource limits against the
/// configured policy, and warns about layers missing on this host.
///
/// # Errors
///
/// Returns an error if the spec or its limits are invalid.
pub fn execute(args: &ValidateArgs, global: &GlobalArgs) -> anyhow::Result<()> {
    let config = global.runtime_config()?;
    let spec = ContainerSpec::load(&args.spec)
        .with_context(|| format!("validating {}", args.spec.display()))?;
    let limits = CgroupController::new(config.cgroup)
        .validate_limits(&spec.resources)
        .with_context(|| format!("validating resources of {}", spec.id))?;

    for layer in spec.rootfs.layers() {
        if !layer.is_dir() {
            tracing::warn!(layer = %layer.display(), "layer directory does not exist on this host");
        }
    }

    println!("{}: ok", spec.id);
    println!("  layers:     {}", spec.rootfs.layers().len());
    let namespaces: Vec<String> = spec.namespaces.iter().map(ToString::to_string).collect();
    println!("  namespaces: {}", namespaces.join(", "));
    if let Some((quota, period)) = limits.cpu_max {
        println!("  cpu.max:    {quota} {period}");
    }
    if let Some(weight) = limits.cpu_weight {
        println!("  cpu.weight: {weight}");
    }
    if let Some(memory) = limits.memory_max {
        println!("  memory.max: {}", format_bytes(memory));
    }
    if let Some(weight) = limits.io_weight {
        println!("  io.weight:  {weight}");
    }
    if let Some(network) = &spec.network {
        let address = network.static_ip.as_deref().unwrap_or("pool");
        println!("  network:    {} ({address})", network.bridge);
    }
    Ok(())
}
