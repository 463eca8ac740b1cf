mod adp;
mod aecp;

use std::time::Duration;

use super::InterfaceCounters;
use crate::protocol::aem::avb_interface_counters;

/// Matches the fixtures' `valid_time`
const VALID_TIME: Duration = Duration::from_secs(10);

#[test]
fn test_interface_counters_layout() {
    let counters = InterfaceCounters {
        link_up: 1,
        frames_tx: 20,
        frames_rx: 30,
        gptp_gm_changed: 2,
    };
    let (valid, values) = counters.to_counters();

    assert_eq!(values[avb_interface_counters::LINK_UP], 1);
    assert_eq!(values[avb_interface_counters::FRAMES_TX], 20);
    assert_eq!(values[avb_interface_counters::FRAMES_RX], 30);
    assert_eq!(values[avb_interface_counters::GPTP_GM_CHANGED], 2);
    assert_eq!(values[avb_interface_counters::LINK_DOWN], 0);
    assert_eq!(valid & (1 << avb_interface_counters::LINK_DOWN), 0);
    assert_ne!(valid & (1 << avb_interface_counters::FRAMES_RX), 0);
}
