// File: manager/src/notifier.rs
//! Email delivery is an external collaborator out of scope for this
//! crate (§1); this module only fixes the interface FleetManager drives
//! it through, matching the templated-event keys in
//! `original_source/jmanager/jm_email.py`.

use tracing::info;

#[derive(Debug, Clone)]
pub enum NotificationEvent {
    Stuck { node_name: String, tip_timeout_min: f64 },
    BootstrapRestart { node_name: String, timeout_min: f64 },
    SlotsAssigned { node_name: String, slot_count: usize },
    Leader { node_name: String },
}

pub trait Notifier: Send + Sync {
    fn notify(&self, event: NotificationEvent);
}

/// Default implementation: logs the event. A real deployment wires in an
/// SMTP-backed `Notifier` at the same boundary.
pub struct LoggingNotifier;

impl Notifier for LoggingNotifier {
    fn notify(&self, event: NotificationEvent) {
        match event {
            NotificationEvent::Stuck { node_name, tip_timeout_min } => {
                info!("notify(stuck): {} has been stuck for over {:.1} min", node_name, tip_timeout_min);
            }
            NotificationEvent::BootstrapRestart { node_name, timeout_min } => {
                info!("notify(bootstrap_restart): {} bootstrapping for over {:.1} min", node_name, timeout_min);
            }
            NotificationEvent::SlotsAssigned { node_name, slot_count } => {
                info!("notify(slots_assigned): {} slots assigned to {}", slot_count, node_name);
            }
            NotificationEvent::Leader { node_name } => {
                info!("notify(leader): {} is now the registered leader", node_name);
            }
        }
    }
}
