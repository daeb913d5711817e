//! rtnetlink message builders for the clsact qdisc and bpf filters.

use crate::tc::{Filter, Qdisc};
use netlink_packet_route::tc::{TcAttribute, TcHandle, TcMessage, TcOption};
use netlink_packet_utils::nla::DefaultNla;

// linux/pkt_cls.h, TCA_BPF_*
const TCA_BPF_FD: u16 = 6;
const TCA_BPF_NAME: u16 = 7;
const TCA_BPF_FLAGS: u16 = 8;
const TCA_BPF_FLAG_ACT_DIRECT: u32 = 1;

pub fn qdisc(qdisc: &Qdisc) -> TcMessage {
    let mut message = TcMessage::with_index(qdisc.link_index as i32);
    message.header.handle = TcHandle::from(qdisc.handle);
    message.header.parent = TcHandle::from(qdisc.parent);
    message
        .attributes
        .push(TcAttribute::Kind(qdisc.kind().to_string()));
    message
}

/// Identifies the filter slot: link, parent, handle, priority and protocol.
pub fn filter_slot(filter: &Filter) -> TcMessage {
    let mut message = TcMessage::with_index(filter.link_index as i32);
    message.header.handle = TcHandle::from(filter.handle);
    message.header.parent = TcHandle::from(filter.parent());
    message.header.info = filter_info(filter.priority, filter.protocol);
    message
        .attributes
        .push(TcAttribute::Kind(filter.kind().to_string()));
    message
}

/// Full filter request carrying the program reference.
pub fn bpf_filter(filter: &Filter) -> TcMessage {
    let mut message = filter_slot(filter);

    let mut name = filter.program.name.as_bytes().to_vec();
    name.push(0);

    let mut options = vec![
        TcOption::Other(DefaultNla::new(
            TCA_BPF_FD,
            (filter.program.fd as u32).to_ne_bytes().to_vec(),
        )),
        TcOption::Other(DefaultNla::new(TCA_BPF_NAME, name)),
    ];
    if filter.direct_action {
        options.push(TcOption::Other(DefaultNla::new(
            TCA_BPF_FLAGS,
            TCA_BPF_FLAG_ACT_DIRECT.to_ne_bytes().to_vec(),
        )));
    }
    message.attributes.push(TcAttribute::Options(options));
    message
}

/// `tcm_info` of a filter: priority in the upper half, protocol in network
/// byte order in the lower half.
pub fn filter_info(priority: u16, protocol: u16) -> u32 {
    (u32::from(priority) << 16) | u32::from(protocol.to_be())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tc::{Direction, FilterOptions, Interface, ProgramHandle, ETH_P_ALL};

    fn test_filter(direction: Direction) -> Filter {
        Filter::new(
            &Interface::new(4, "veth0"),
            direction,
            &ProgramHandle {
                fd: 12,
                name: "probe".to_string(),
            },
            &FilterOptions::default(),
        )
    }

    fn kind(message: &TcMessage) -> Option<&str> {
        message.attributes.iter().find_map(|attr| match attr {
            TcAttribute::Kind(kind) => Some(kind.as_str()),
            _ => None,
        })
    }

    #[test]
    fn test_qdisc_message() {
        let message = qdisc(&Qdisc::clsact(&Interface::new(4, "veth0")));

        assert_eq!(message.header.index, 4);
        assert_eq!(u32::from(message.header.handle), 0xFFFF_0000);
        assert_eq!(u32::from(message.header.parent), 0xFFFF_FFF1);
        assert_eq!(kind(&message), Some("clsact"));
    }

    #[test]
    fn test_filter_info_layout() {
        // ETH_P_ALL is 0x0003, sent big endian.
        assert_eq!(filter_info(1, ETH_P_ALL), 0x0001_0000 | u32::from(0x0003u16.to_be()));
        assert_eq!(filter_info(0xabcd, 0) >> 16, 0xabcd);
    }

    #[test]
    fn test_bpf_filter_message() {
        let message = bpf_filter(&test_filter(Direction::Ingress));

        assert_eq!(message.header.index, 4);
        assert_eq!(u32::from(message.header.parent), 0xFFFF_FFF2);
        assert_eq!(u32::from(message.header.handle), 1);
        assert_eq!(kind(&message), Some("bpf"));

        let options = message
            .attributes
            .iter()
            .find_map(|attr| match attr {
                TcAttribute::Options(options) => Some(options),
                _ => None,
            })
            .expect("bpf filter carries options");
        assert_eq!(options.len(), 3, "fd, name and direct-action flags");
    }

    #[test]
    fn test_filter_slot_has_no_program() {
        let message = filter_slot(&test_filter(Direction::Egress));

        assert_eq!(u32::from(message.header.parent), 0xFFFF_FFF3);
        assert!(!message
            .attributes
            .iter()
            .any(|attr| matches!(attr, TcAttribute::Options(_))));
    }
}
