//! Control channel to the kernel's traffic-control configuration plane.
//!
//! Every qdisc and filter operation goes through a [`ControlChannel`]. The
//! real implementation is an rtnetlink session; tests drive the same seam
//! with an in-memory kernel.

#[cfg(target_os = "linux")]
pub mod message;

use crate::tc::{Filter, Qdisc};
use crate::Result;
use async_trait::async_trait;

#[async_trait]
pub trait ControlChannel: Send {
    /// Create `qdisc`. Fails if one already sits at its parent.
    async fn add_qdisc(&mut self, qdisc: &Qdisc) -> Result<()>;

    /// Delete `qdisc` together with every filter attached to it.
    async fn delete_qdisc(&mut self, qdisc: &Qdisc) -> Result<()>;

    /// Create `filter`, or replace whatever occupies its slot.
    async fn replace_filter(&mut self, filter: &Filter) -> Result<()>;

    async fn delete_filter(&mut self, filter: &Filter) -> Result<()>;

    /// Release the session. Consumes the channel, so it can only happen once.
    async fn close(self) -> Result<()>;
}

#[cfg(target_os = "linux")]
pub use netlink_channel::NetlinkChannel;

#[cfg(target_os = "linux")]
mod netlink_channel {
    use super::{message, ControlChannel};
    use crate::tc::{Filter, Qdisc};
    use crate::{FlowlatError, Result};
    use async_trait::async_trait;
    use futures::StreamExt;
    use netlink_packet_core::{
        NetlinkMessage, NetlinkPayload, NLM_F_ACK, NLM_F_CREATE, NLM_F_EXCL, NLM_F_REPLACE,
        NLM_F_REQUEST,
    };
    use netlink_packet_route::RouteNetlinkMessage;
    use rtnetlink::Handle;
    use tokio::task::JoinHandle;
    use tracing::debug;

    /// rtnetlink session owned by one probe.
    pub struct NetlinkChannel {
        handle: Handle,
        connection: JoinHandle<()>,
    }

    impl NetlinkChannel {
        /// Open a NETLINK_ROUTE socket and drive it on the current runtime.
        pub fn open() -> Result<Self> {
            let (connection, handle, _) =
                rtnetlink::new_connection().map_err(FlowlatError::ControlChannel)?;
            let connection = tokio::spawn(connection);
            debug!("netlink control channel opened");
            Ok(Self { handle, connection })
        }

        async fn execute(
            &mut self,
            operation: &'static str,
            link_index: u32,
            request: RouteNetlinkMessage,
            flags: u16,
        ) -> Result<()> {
            let mut request = NetlinkMessage::from(request);
            request.header.flags = flags;

            let mut response = self
                .handle
                .request(request)
                .map_err(|e| FlowlatError::Netlink {
                    operation,
                    link_index,
                    errno: None,
                    message: e.to_string(),
                })?;

            while let Some(reply) = response.next().await {
                if let NetlinkPayload::Error(err) = reply.payload {
                    // An error message without a code is the ACK.
                    if let Some(code) = err.code {
                        let errno = -code.get();
                        return Err(FlowlatError::Netlink {
                            operation,
                            link_index,
                            errno: Some(errno),
                            message: std::io::Error::from_raw_os_error(errno).to_string(),
                        });
                    }
                }
            }

            Ok(())
        }
    }

    #[async_trait]
    impl ControlChannel for NetlinkChannel {
        async fn add_qdisc(&mut self, qdisc: &Qdisc) -> Result<()> {
            self.execute(
                "qdisc add",
                qdisc.link_index,
                RouteNetlinkMessage::NewQueueDiscipline(message::qdisc(qdisc)),
                NLM_F_REQUEST | NLM_F_ACK | NLM_F_CREATE | NLM_F_EXCL,
            )
            .await
        }

        async fn delete_qdisc(&mut self, qdisc: &Qdisc) -> Result<()> {
            self.execute(
                "qdisc delete",
                qdisc.link_index,
                RouteNetlinkMessage::DelQueueDiscipline(message::qdisc(qdisc)),
                NLM_F_REQUEST | NLM_F_ACK,
            )
            .await
        }

        async fn replace_filter(&mut self, filter: &Filter) -> Result<()> {
            self.execute(
                "filter replace",
                filter.link_index,
                RouteNetlinkMessage::NewTrafficFilter(message::bpf_filter(filter)),
                NLM_F_REQUEST | NLM_F_ACK | NLM_F_CREATE | NLM_F_REPLACE,
            )
            .await
        }

        async fn delete_filter(&mut self, filter: &Filter) -> Result<()> {
            self.execute(
                "filter delete",
                filter.link_index,
                RouteNetlinkMessage::DelTrafficFilter(message::filter_slot(filter)),
                NLM_F_REQUEST | NLM_F_ACK,
            )
            .await
        }

        async fn close(self) -> Result<()> {
            let NetlinkChannel { handle, connection } = self;
            drop(handle);
            connection.abort();
            match connection.await {
                Ok(()) => {}
                Err(e) if e.is_cancelled() => {}
                Err(e) => {
                    return Err(FlowlatError::ControlChannel(std::io::Error::other(
                        e.to_string(),
                    )))
                }
            }
            debug!("netlink control channel closed");
            Ok(())
        }
    }
}
