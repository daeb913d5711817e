use super::{Interface, Qdisc};
use crate::netlink::ControlChannel;
use crate::{FlowlatError, Result};
use tracing::{debug, info};

const EEXIST: i32 = 17;

/// Add a clsact qdisc to `iface`.
///
/// An existing clsact qdisc is reported as [`FlowlatError::QdiscExists`].
/// It belongs to someone else and teardown must not delete it.
pub async fn attach<C: ControlChannel>(channel: &mut C, iface: &Interface) -> Result<Qdisc> {
    let qdisc = Qdisc::clsact(iface);
    debug!(iface = %iface.name, handle = qdisc.handle, "adding clsact qdisc");

    match channel.add_qdisc(&qdisc).await {
        Ok(()) => {
            info!(iface = %iface.name, "clsact qdisc attached");
            Ok(qdisc)
        }
        Err(e) if e.errno() == Some(EEXIST) => Err(FlowlatError::QdiscExists {
            iface: iface.name.clone(),
        }),
        Err(e) => Err(e),
    }
}

/// Delete the qdisc. The kernel removes both filters with it.
pub async fn detach<C: ControlChannel>(channel: &mut C, qdisc: &Qdisc) -> Result<()> {
    channel.delete_qdisc(qdisc).await?;
    info!(link_index = qdisc.link_index, "clsact qdisc detached");
    Ok(())
}
