//! Probe lifecycle: attach, run until cancelled, tear down exactly once.
//!
//! ```text
//! Uninitialized -> Loaded -> Attached -> Running -> Closing -> Closed
//! ```
//!
//! States only move forward. A failure anywhere jumps to `Closing`, which
//! releases whatever had been acquired so far in reverse order.

use crate::config::{Config, ExportConfig};
use crate::ebpf::events::{spawn_exporter, ExportStats};
use crate::ebpf::{maps, Hook, HookLoader};
use crate::error::{TeardownErrors, TeardownStep};
use crate::mac::MacAddr;
use crate::netlink::ControlChannel;
use crate::tc::{filter, qdisc, Filter, FilterOptions, Interface, Qdisc};
use crate::{FlowlatError, Result};
use bytes::Bytes;
use std::fmt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ProbeState {
    Uninitialized,
    Loaded,
    Attached,
    Running,
    Closing,
    Closed,
}

impl ProbeState {
    pub const fn as_str(&self) -> &'static str {
        match self {
            ProbeState::Uninitialized => "uninitialized",
            ProbeState::Loaded => "loaded",
            ProbeState::Attached => "attached",
            ProbeState::Running => "running",
            ProbeState::Closing => "closing",
            ProbeState::Closed => "closed",
        }
    }
}

impl fmt::Display for ProbeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a probe is started with.
#[derive(Debug, Clone, Default)]
pub struct ProbeOptions {
    pub mac: MacAddr,
    pub filter: FilterOptions,
    pub export: ExportConfig,
}

impl From<&Config> for ProbeOptions {
    fn from(config: &Config) -> Self {
        Self {
            mac: config.mac,
            filter: config.filter,
            export: config.export.clone(),
        }
    }
}

/// How a run ended.
#[derive(Debug, Default)]
pub struct RunSummary {
    /// Records handed to the event callback.
    pub delivered: u64,
    pub export: Option<ExportStats>,
    pub teardown: TeardownErrors,
}

enum Next {
    Cancelled,
    Record(Bytes),
    ExporterDone,
}

/// One probe on one interface.
///
/// Owns the control channel, the loaded hook, the qdisc and filters it
/// installed, and the exporter task.
pub struct Probe<C: ControlChannel, H: Hook> {
    iface: Interface,
    state: ProbeState,
    channel: Option<C>,
    hook: Option<H>,
    qdisc: Option<Qdisc>,
    filters: Vec<Filter>,
    stop: CancellationToken,
    records: Option<mpsc::Receiver<Bytes>>,
    exporter: Option<JoinHandle<Result<ExportStats>>>,
    stats: Option<ExportStats>,
}

impl<C: ControlChannel, H: Hook> Probe<C, H> {
    pub fn new(iface: Interface) -> Self {
        Self {
            iface,
            state: ProbeState::Uninitialized,
            channel: None,
            hook: None,
            qdisc: None,
            filters: Vec::new(),
            stop: CancellationToken::new(),
            records: None,
            exporter: None,
            stats: None,
        }
    }

    pub fn state(&self) -> ProbeState {
        self.state
    }

    pub fn interface(&self) -> &Interface {
        &self.iface
    }

    pub fn qdisc(&self) -> Option<&Qdisc> {
        self.qdisc.as_ref()
    }

    pub fn filters(&self) -> &[Filter] {
        &self.filters
    }

    /// Bring the probe from `Uninitialized` to `Running`.
    ///
    /// The config table is written before the qdisc and filters go in, so
    /// the hook never sees traffic unconfigured. On failure everything
    /// acquired so far is released and the setup error is returned; the
    /// probe is then `Closed`.
    pub async fn start<F, L>(&mut self, open: F, loader: &L, options: &ProbeOptions) -> Result<()>
    where
        F: FnOnce() -> Result<C>,
        L: HookLoader<Hook = H>,
    {
        if self.state != ProbeState::Uninitialized {
            return Err(FlowlatError::InvalidState {
                expected: ProbeState::Uninitialized.as_str(),
                actual: self.state.as_str(),
            });
        }

        info!(iface = %self.iface, mac = %options.mac, "starting probe");

        if let Err(e) = self.setup(open, loader, options).await {
            error!(iface = %self.iface, state = %self.state, error = %e, "probe setup failed");
            if let Err(teardown) = self.shutdown().await {
                warn!(iface = %self.iface, errors = %teardown, "cleanup after failed setup incomplete");
            }
            return Err(e);
        }

        info!(iface = %self.iface, "probe running");
        Ok(())
    }

    async fn setup<F, L>(&mut self, open: F, loader: &L, options: &ProbeOptions) -> Result<()>
    where
        F: FnOnce() -> Result<C>,
        L: HookLoader<Hook = H>,
    {
        self.channel = Some(open()?);
        self.hook = Some(loader.load()?);
        self.set_state(ProbeState::Loaded);

        {
            let Self {
                iface,
                channel,
                hook,
                qdisc: installed_qdisc,
                filters,
                ..
            } = self;
            let (Some(channel), Some(hook)) = (channel.as_mut(), hook.as_mut()) else {
                return Err(FlowlatError::InvalidState {
                    expected: ProbeState::Loaded.as_str(),
                    actual: ProbeState::Uninitialized.as_str(),
                });
            };

            maps::write_address(hook.config_table(), options.mac)?;
            *installed_qdisc = Some(qdisc::attach(channel, iface).await?);
            filter::install(channel, iface, hook.program(), &options.filter, filters).await?;
        }
        self.set_state(ProbeState::Attached);

        let events = match self.hook.as_mut() {
            Some(hook) => hook.take_events()?,
            None => {
                return Err(FlowlatError::InvalidState {
                    expected: ProbeState::Attached.as_str(),
                    actual: ProbeState::Uninitialized.as_str(),
                })
            }
        };
        let (records, exporter) = spawn_exporter(events, &options.export, self.stop.clone());
        self.records = Some(records);
        self.exporter = Some(exporter);
        self.set_state(ProbeState::Running);

        Ok(())
    }

    /// Read the address back out of the config table.
    pub fn configured_address(&mut self) -> Result<MacAddr> {
        match self.hook.as_mut() {
            Some(hook) => maps::read_address(hook.config_table()),
            None => Err(FlowlatError::InvalidState {
                expected: ProbeState::Running.as_str(),
                actual: self.state.as_str(),
            }),
        }
    }

    /// Deliver records to `on_event` until `cancel` fires or the exporter
    /// ends, then tear down.
    ///
    /// An exporter that gave up (or panicked) is returned as the error after
    /// teardown ran; teardown failures are carried in the summary.
    pub async fn run<F>(&mut self, cancel: &CancellationToken, mut on_event: F) -> Result<RunSummary>
    where
        F: FnMut(Bytes),
    {
        if self.state != ProbeState::Running {
            return Err(FlowlatError::InvalidState {
                expected: ProbeState::Running.as_str(),
                actual: self.state.as_str(),
            });
        }

        let mut delivered = 0u64;
        let outcome = loop {
            let next = match self.records.as_mut() {
                Some(records) => tokio::select! {
                    biased;
                    _ = cancel.cancelled() => Next::Cancelled,
                    record = records.recv() => match record {
                        Some(record) => Next::Record(record),
                        None => Next::ExporterDone,
                    },
                },
                None => Next::ExporterDone,
            };

            match next {
                Next::Cancelled => {
                    info!(iface = %self.iface, "cancellation requested");
                    break Ok(());
                }
                Next::Record(record) => {
                    delivered += 1;
                    on_event(record);
                }
                Next::ExporterDone => break self.join_exporter().await,
            }
        };

        let teardown = match self.shutdown().await {
            Ok(()) => TeardownErrors::default(),
            Err(errors) => errors,
        };

        if let Err(e) = outcome {
            if !teardown.is_empty() {
                warn!(iface = %self.iface, errors = %teardown, "teardown after runtime failure incomplete");
            }
            return Err(e);
        }

        Ok(RunSummary {
            delivered,
            export: self.stats,
            teardown,
        })
    }

    /// The exporter closed its queue on its own; collect why.
    async fn join_exporter(&mut self) -> Result<()> {
        let Some(handle) = self.exporter.take() else {
            return Ok(());
        };
        match handle.await {
            Ok(Ok(stats)) => {
                self.stats = Some(stats);
                Ok(())
            }
            Ok(Err(e)) => {
                error!(iface = %self.iface, error = %e, "event exporter failed");
                Err(e)
            }
            Err(e) => Err(FlowlatError::ExporterFailed(e.to_string())),
        }
    }

    /// Release everything this probe acquired, in order: stop the exporter,
    /// delete the qdisc (or the filters one by one if that fails), close the
    /// hook, close the channel.
    ///
    /// Every step runs even when an earlier one failed. Calling it again
    /// once the probe is `Closed` does nothing.
    pub async fn shutdown(&mut self) -> std::result::Result<(), TeardownErrors> {
        if self.state == ProbeState::Closed {
            debug!(iface = %self.iface, "probe already closed");
            return Ok(());
        }
        self.set_state(ProbeState::Closing);

        let mut errors = TeardownErrors::default();

        self.stop.cancel();
        self.records = None;
        if let Some(handle) = self.exporter.take() {
            match handle.await {
                Ok(Ok(stats)) => self.stats = Some(stats),
                Ok(Err(e)) => errors.push(TeardownStep::StopExporter, e),
                Err(e) => errors.push(
                    TeardownStep::StopExporter,
                    FlowlatError::ExporterFailed(e.to_string()),
                ),
            }
        }

        if let Some(channel) = self.channel.as_mut() {
            let detached = match self.qdisc.take() {
                Some(installed) => match qdisc::detach(channel, &installed).await {
                    Ok(()) => {
                        self.filters.clear();
                        true
                    }
                    Err(e) => {
                        warn!(iface = %self.iface, error = %e, "qdisc delete failed, removing filters individually");
                        errors.push(TeardownStep::DetachQdisc, e);
                        false
                    }
                },
                None => false,
            };

            if !detached && !self.filters.is_empty() {
                for (step, e) in filter::remove(channel, &mut self.filters).await {
                    errors.push(step, e);
                }
            }
        }

        if let Some(hook) = self.hook.take() {
            if let Err(e) = hook.close() {
                errors.push(TeardownStep::CloseHook, e);
            }
        }

        if let Some(channel) = self.channel.take() {
            if let Err(e) = channel.close().await {
                errors.push(TeardownStep::CloseChannel, e);
            }
        }

        self.set_state(ProbeState::Closed);

        if errors.is_empty() {
            info!(iface = %self.iface, "probe torn down");
        } else {
            warn!(iface = %self.iface, errors = %errors, "probe teardown incomplete");
        }
        errors.into_result()
    }

    fn set_state(&mut self, next: ProbeState) {
        debug_assert!(next >= self.state, "{} -> {}", self.state, next);
        debug!(iface = %self.iface, from = %self.state, to = %next, "probe state");
        self.state = next;
    }
}

impl<C: ControlChannel, H: Hook> Drop for Probe<C, H> {
    fn drop(&mut self) {
        if matches!(self.state, ProbeState::Uninitialized | ProbeState::Closed) {
            return;
        }
        warn!(
            iface = %self.iface,
            state = %self.state,
            "probe dropped without shutdown, tc objects may remain on the interface"
        );
        self.stop.cancel();
        if let Some(handle) = self.exporter.take() {
            handle.abort();
        }
    }
}
