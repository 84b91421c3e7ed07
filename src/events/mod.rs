use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::entities::Stage;

#[derive(Debug, Clone)]
pub struct EventSender {
    sender: mpsc::Sender<Event>,
}

impl EventSender {
    /// Creates a new EventSender
    pub fn new(sender: mpsc::Sender<Event>) -> Self {
        Self { sender }
    }

    /// Creates a bounded channel and returns both halves.
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<Event>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self::new(tx), rx)
    }

    /// Sends an event asynchronously
    pub async fn send(&self, event: Event) -> Result<(), String> {
        self.sender
            .send(event)
            .await
            .map_err(|e| format!("Failed to send event: {}", e))
    }

    /// Sends an event, logging instead of failing when the receiver is gone.
    ///
    /// Events are emitted after commit, so a delivery failure must never
    /// surface as an error of the operation that produced them.
    pub async fn send_or_log(&self, event: Event) {
        if let Err(e) = self.send(event).await {
            warn!("Dropping domain event: {}", e);
        }
    }
}

/// Post-commit notifications emitted by the production services.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum Event {
    OrderCreated {
        order_id: i32,
        line_items: usize,
    },
    StageAdvanced {
        order_id: i32,
        source_stage: Stage,
        destination_stages: Vec<Stage>,
        employee_id: String,
        quantity: i64,
        occurred_at: DateTime<Utc>,
    },
    InvoiceIssued {
        order_id: i32,
        invoice_id: i32,
        number: String,
    },
    ProcessInstanceClosed {
        order_id: i32,
        process_instance_id: i32,
        stage: Stage,
    },
    OrderCompleted {
        order_id: i32,
        employee_id: String,
    },
    OrderDeactivated {
        order_id: i32,
        cancelled_instances: usize,
    },
    OrderReactivated {
        order_id: i32,
        restored_instances: usize,
    },
}

/// Drains the event channel, logging every event until all senders are dropped.
pub async fn process_events(mut rx: mpsc::Receiver<Event>) {
    info!("Starting event processing loop");

    while let Some(event) = rx.recv().await {
        match &event {
            Event::StageAdvanced {
                order_id,
                source_stage,
                destination_stages,
                employee_id,
                quantity,
                ..
            } => {
                info!(
                    order_id,
                    %source_stage,
                    ?destination_stages,
                    employee_id = %employee_id,
                    quantity,
                    "Stage advanced"
                );
            }
            Event::InvoiceIssued {
                order_id,
                invoice_id,
                number,
            } => {
                info!(order_id, invoice_id, number = %number, "Invoice issued");
            }
            Event::ProcessInstanceClosed {
                order_id,
                process_instance_id,
                stage,
            } => {
                info!(order_id, process_instance_id, %stage, "Process instance closed");
            }
            other => {
                info!("Received event: {:?}", other);
            }
        }
    }

    warn!("Event processing loop has ended");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn send_or_log_survives_a_closed_receiver() {
        let (sender, rx) = EventSender::channel(4);
        drop(rx);
        sender
            .send_or_log(Event::OrderCompleted {
                order_id: 1,
                employee_id: "emp1".into(),
            })
            .await;
    }

    #[tokio::test]
    async fn events_arrive_in_order() {
        let (sender, mut rx) = EventSender::channel(4);
        sender
            .send(Event::OrderCreated {
                order_id: 9,
                line_items: 2,
            })
            .await
            .unwrap();
        sender
            .send(Event::OrderDeactivated {
                order_id: 9,
                cancelled_instances: 1,
            })
            .await
            .unwrap();

        assert_eq!(
            rx.recv().await,
            Some(Event::OrderCreated {
                order_id: 9,
                line_items: 2
            })
        );
        assert!(matches!(
            rx.recv().await,
            Some(Event::OrderDeactivated { order_id: 9, .. })
        ));
    }
}
