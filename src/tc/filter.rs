use super::{Direction, Filter, FilterOptions, Interface, ProgramHandle};
use crate::error::TeardownStep;
use crate::netlink::ControlChannel;
use crate::{FlowlatError, Result};
use tracing::{info, warn};

/// Install the ingress and egress filters pointing at `program`.
///
/// Both directions are always attempted. Every filter that made it into the
/// kernel is appended to `installed`, also when the step fails overall, so
/// the caller knows what to clean up.
pub async fn install<C: ControlChannel>(
    channel: &mut C,
    iface: &Interface,
    program: &ProgramHandle,
    options: &FilterOptions,
    installed: &mut Vec<Filter>,
) -> Result<()> {
    let mut failures = Vec::new();

    for direction in Direction::ALL {
        let filter = Filter::new(iface, direction, program, options);
        match channel.replace_filter(&filter).await {
            Ok(()) => {
                info!(
                    iface = %iface.name,
                    direction = direction.as_str(),
                    program = %program.name,
                    "tc filter installed"
                );
                // A retried install lands in the same slot.
                installed.retain(|f| !f.same_slot(&filter));
                installed.push(filter);
            }
            Err(e) => {
                warn!(iface = %iface.name, direction = direction.as_str(), error = %e, "tc filter install failed");
                failures.push((direction, e));
            }
        }
    }

    if failures.is_empty() {
        return Ok(());
    }

    Err(FlowlatError::FilterInstall {
        iface: iface.name.clone(),
        installed: installed.iter().map(|f| f.direction).collect(),
        failures,
    })
}

/// Delete `filters` one by one. Only used when deleting the qdisc failed.
///
/// Filters that could not be removed stay in `filters`; the errors are
/// returned with the step they belong to.
pub async fn remove<C: ControlChannel>(
    channel: &mut C,
    filters: &mut Vec<Filter>,
) -> Vec<(TeardownStep, FlowlatError)> {
    let mut errors = Vec::new();
    let mut remaining = Vec::new();

    for filter in filters.drain(..) {
        match channel.delete_filter(&filter).await {
            Ok(()) => info!(
                link_index = filter.link_index,
                direction = filter.direction.as_str(),
                "tc filter removed"
            ),
            Err(e) => {
                errors.push((TeardownStep::RemoveFilter(filter.direction), e));
                remaining.push(filter);
            }
        }
    }

    *filters = remaining;
    errors
}
