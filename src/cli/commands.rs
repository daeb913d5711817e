use crate::config::Config;
use crate::ebpf::loader::{AyaHookLoader, HookSource, LoaderOptions};
use crate::netlink::NetlinkChannel;
use crate::probe::{Probe, ProbeOptions};
use crate::tc::Interface;
use crate::{FlowlatError, Result};
use std::io::Write;
use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Attach to the configured interface and print records until SIGINT or
/// SIGTERM.
pub async fn run(config: Config) -> Result<()> {
    let iface = Interface::by_name(&config.interface)?;
    let loader = AyaHookLoader::new(hook_source(&config), loader_options(&config));
    let options = ProbeOptions::from(&config);

    let cancel = CancellationToken::new();
    spawn_signal_handler(cancel.clone())?;

    let mut probe = Probe::new(iface);
    probe.start(NetlinkChannel::open, &loader, &options).await?;

    match probe.configured_address() {
        Ok(mac) => debug!(%mac, "config table read back"),
        Err(e) => warn!(error = %e, "config table read back failed"),
    }

    info!(iface = %config.interface, "Probe attached. Press Ctrl+C to exit.");

    let stdout = std::io::stdout();
    let summary = probe
        .run(&cancel, |record| {
            let mut out = stdout.lock();
            if let Err(e) = writeln!(out, "{:?}", record.as_ref()) {
                debug!(error = %e, "failed to write record to stdout");
            }
        })
        .await?;

    if let Some(stats) = summary.export {
        info!(
            delivered = summary.delivered,
            dropped = stats.dropped,
            read_errors = stats.read_errors,
            "flowlat stopped"
        );
    }

    if !summary.teardown.is_empty() && config.teardown_errors_fatal {
        return Err(FlowlatError::Teardown(summary.teardown));
    }
    Ok(())
}

fn hook_source(config: &Config) -> HookSource {
    if let Some(path) = &config.object_path {
        return HookSource::File(path.clone());
    }

    #[cfg(feature = "embed-probe")]
    {
        HookSource::embedded()
    }

    #[cfg(not(feature = "embed-probe"))]
    {
        HookSource::File(crate::config::DEFAULT_OBJECT_PATH.into())
    }
}

fn loader_options(config: &Config) -> LoaderOptions {
    LoaderOptions {
        program_name: config.program_name.clone(),
        config_map: config.config_map.clone(),
        events_map: config.events_map.clone(),
        memlock_limit: config.memlock_limit_bytes,
        preflight: true,
    }
}

fn spawn_signal_handler(cancel: CancellationToken) -> Result<()> {
    let mut terminate = signal(SignalKind::terminate())?;

    tokio::spawn(async move {
        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                if let Err(e) = result {
                    warn!(error = %e, "failed to listen for SIGINT");
                }
                info!("Shutdown signal received");
            }
            _ = terminate.recv() => info!("SIGTERM received"),
        }
        cancel.cancel();
    });

    Ok(())
}
