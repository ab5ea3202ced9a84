//! Counter type ids and the always-allocated system counters.

use sluice_logbuffer::{CounterTable, CountersError, NULL_OWNER_ID, NULL_REGISTRATION_ID, Position};
use sluice_timing::Nanos;

pub const SYSTEM_COUNTER_TYPE_ID: i32 = 0;
pub const PUBLISHER_LIMIT_TYPE_ID: i32 = 1;
pub const SENDER_POSITION_TYPE_ID: i32 = 2;
pub const RECEIVER_HWM_TYPE_ID: i32 = 3;
pub const SUBSCRIBER_POSITION_TYPE_ID: i32 = 4;
pub const RECEIVER_POSITION_TYPE_ID: i32 = 5;
pub const SENDER_LIMIT_TYPE_ID: i32 = 9;
pub const PUBLISHER_POSITION_TYPE_ID: i32 = 12;

macro_rules! system_counters {
    ($(($field:ident, $label:expr)),+ $(,)?) => {
        /// Driver-wide statistics, allocated once at startup. Copyable so
        /// each agent carries its own handles.
        #[derive(Clone, Copy, Debug)]
        pub struct SystemCounters {
            $(pub $field: Position,)+
        }

        impl SystemCounters {
            pub fn allocate(table: &CounterTable, now: Nanos) -> Result<Self, CountersError> {
                Ok(Self {
                    $($field: {
                        let id = table.allocate(
                            SYSTEM_COUNTER_TYPE_ID,
                            b"",
                            $label,
                            NULL_REGISTRATION_ID,
                            NULL_OWNER_ID,
                            now,
                        )?;
                        table.position(id)
                    },)+
                })
            }
        }
    };
}

system_counters!(
    (errors, "Errors"),
    (unblocked_publications, "Unblocked Publications"),
    (back_pressure_events, "Back Pressure Events"),
    (bytes_sent, "Bytes Sent"),
    (bytes_received, "Bytes Received"),
    (naks_sent, "NAKs Sent"),
    (naks_received, "NAKs Received"),
    (retransmits_sent, "Retransmits Sent"),
    (heartbeats_sent, "Heartbeats Sent"),
    (heartbeats_received, "Heartbeats Received"),
    (status_messages_sent, "Status Messages Sent"),
    (status_messages_received, "Status Messages Received"),
    (short_sends, "Short Sends"),
    (client_timeouts, "Client Timeouts"),
    (images_rejected, "Images Rejected"),
    (conductor_cycle_overruns, "Conductor Cycle Overruns"),
);

#[cfg(test)]
mod tests {
    use sluice_logbuffer::{MappedRegion, METADATA_RECORD_LENGTH, VALUE_RECORD_LENGTH};

    use super::*;

    #[test]
    fn allocates_all() {
        let region = MappedRegion::heap(64 * (METADATA_RECORD_LENGTH + VALUE_RECORD_LENGTH));
        let table = CounterTable::new(
            region.buffer(0, 64 * METADATA_RECORD_LENGTH),
            region.buffer(64 * METADATA_RECORD_LENGTH, 64 * VALUE_RECORD_LENGTH),
            Nanos::ZERO,
        );
        let counters = SystemCounters::allocate(&table, Nanos(1)).unwrap();
        counters.errors.increment();
        counters.bytes_sent.add(48);
        assert_eq!(table.position(counters.errors.id()).get(), 1);
        assert_eq!(table.position(counters.bytes_sent.id()).get(), 48);
        assert_eq!(table.label(counters.unblocked_publications.id()), "Unblocked Publications");
    }
}
