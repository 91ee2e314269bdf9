//! Client request layer: correlated request/response over the bus.

use std::sync::Arc;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::bus::{Bus, Subscription};
use crate::config::DEFAULT_REQUEST_TIMEOUT;
use crate::error::{Error, Result};
use crate::model::{Operation, OperationArgs, OperationId};
use crate::protocol::{
    Message, REQUEST_TOPIC, RequestId, ResponseAbort, ResponseCreate, ResponseList,
    ResponseResult, STATUS_TOPIC, StatusUpdate, status_topic,
};

/// Issues requests to a daemon sharing the same bus.
#[derive(Clone)]
pub struct Client {
    bus: Arc<Bus<Message>>,
    timeout: Duration,
}

impl Client {
    pub fn new(bus: Arc<Bus<Message>>) -> Self {
        Self {
            bus,
            timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Ask the daemon to create and start an operation.
    pub fn create_operation(&self, args: OperationArgs) -> Result<Operation> {
        let (id, message) = Message::request_create(args);
        match self.request(id, message)? {
            Message::ResponseCreate(ResponseCreate {
                result: ResponseResult::Ok,
                operation: Some(operation),
                ..
            }) => Ok(operation),
            Message::ResponseCreate(ResponseCreate { message, .. }) => Err(Error::Daemon(
                message.unwrap_or_else(|| "create request failed".to_string()),
            )),
            _ => Err(Error::UnexpectedResponse("create")),
        }
    }

    pub fn abort_operation(&self, operation_id: OperationId) -> Result<()> {
        let (id, message) = Message::request_abort(operation_id);
        match self.request(id, message)? {
            Message::ResponseAbort(ResponseAbort {
                result: ResponseResult::Ok,
                ..
            }) => Ok(()),
            Message::ResponseAbort(ResponseAbort { message, .. }) => Err(Error::Daemon(
                message.unwrap_or_else(|| "abort request failed".to_string()),
            )),
            _ => Err(Error::UnexpectedResponse("abort")),
        }
    }

    /// Snapshot of every operation the daemon knows, in creation order.
    pub fn list_operations(&self) -> Result<Vec<Operation>> {
        let (id, message) = Message::request_list();
        match self.request(id, message)? {
            Message::ResponseList(ResponseList { operations }) => Ok(operations),
            _ => Err(Error::UnexpectedResponse("list")),
        }
    }

    /// Follow the status updates of `ids`, or of every operation when `ids` is empty.
    ///
    /// Updates published after this call returns are queued until read.
    pub fn monitor(&self, ids: &[OperationId]) -> Monitor {
        let (sender, receiver) = mpsc::channel();
        let topics: Vec<String> = if ids.is_empty() {
            vec![STATUS_TOPIC.to_string()]
        } else {
            ids.iter().map(|id| status_topic(*id)).collect()
        };
        let subscriptions = topics
            .into_iter()
            .map(|topic| {
                let sender = sender.clone();
                self.bus.subscribe(topic, move |message: &Message| {
                    if let Message::StatusUpdate(update) = message {
                        let _ = sender.send(update.clone());
                    }
                })
            })
            .collect();
        Monitor {
            bus: Arc::clone(&self.bus),
            subscriptions,
            receiver,
        }
    }

    // The reply subscription exists before the request is published, so a
    // daemon answering synchronously cannot outrun it.
    fn request(&self, id: RequestId, message: Message) -> Result<Message> {
        let (sender, receiver) = mpsc::sync_channel(1);
        let subscription = self.bus.subscribe_once(id.topic(), move |reply: &Message| {
            let _ = sender.try_send(reply.clone());
        });

        debug!(request = %id, kind = message.name(), "sending request");
        if self.bus.publish(REQUEST_TOPIC, &message) == 0 {
            debug!(request = %id, "no daemon subscribed");
        }

        match receiver.recv_timeout(self.timeout) {
            Ok(reply) => {
                debug!(request = %id, kind = reply.name(), "received response");
                Ok(reply)
            }
            Err(_) => {
                self.bus.unsubscribe(&subscription);
                warn!(request = %id, timeout = ?self.timeout, "request timed out");
                Err(Error::Timeout)
            }
        }
    }
}

/// Live feed of status updates. Unsubscribes when dropped.
pub struct Monitor {
    bus: Arc<Bus<Message>>,
    subscriptions: Vec<Subscription>,
    receiver: Receiver<StatusUpdate>,
}

impl Monitor {
    /// Updates that are already queued.
    pub fn drain(&self) -> Vec<StatusUpdate> {
        self.receiver.try_iter().collect()
    }

    /// Consume updates until each of `ids` has reported a terminal status.
    ///
    /// Every consumed update is passed to `on_update`. Returns the terminal
    /// updates in arrival order. With `deadline` set, fails with
    /// [`Error::Timeout`] when it passes first.
    pub fn wait_finished<F>(
        &self,
        ids: &[OperationId],
        deadline: Option<Duration>,
        mut on_update: F,
    ) -> Result<Vec<StatusUpdate>>
    where
        F: FnMut(&StatusUpdate),
    {
        let until = deadline.map(|d| Instant::now() + d);
        let mut outstanding: Vec<OperationId> = ids.to_vec();
        let mut terminal = Vec::with_capacity(ids.len());

        while !outstanding.is_empty() {
            let update = match until {
                Some(until) => {
                    let remaining = until.saturating_duration_since(Instant::now());
                    match self.receiver.recv_timeout(remaining) {
                        Ok(update) => update,
                        Err(RecvTimeoutError::Timeout) => return Err(Error::Timeout),
                        Err(RecvTimeoutError::Disconnected) => break,
                    }
                }
                None => match self.receiver.recv() {
                    Ok(update) => update,
                    Err(_) => break,
                },
            };

            on_update(&update);
            if update.status.finished {
                if let Some(pos) = outstanding.iter().position(|id| *id == update.operation_id) {
                    outstanding.swap_remove(pos);
                    terminal.push(update);
                }
            }
        }
        Ok(terminal)
    }
}

impl Drop for Monitor {
    fn drop(&mut self) {
        for subscription in &self.subscriptions {
            self.bus.unsubscribe(subscription);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::OperationStatus;

    #[test]
    fn request_without_daemon_times_out_and_cleans_up() {
        let bus = Arc::new(Bus::new());
        let (seen_tx, seen_rx) = mpsc::channel();
        bus.subscribe(REQUEST_TOPIC, move |message: &Message| {
            if let Message::RequestList(request) = message {
                let _ = seen_tx.send(request.id);
            }
        });

        let client = Client::new(Arc::clone(&bus)).with_timeout(Duration::from_millis(50));
        let started = Instant::now();
        let err = client.list_operations().unwrap_err();
        assert!(matches!(err, Error::Timeout));
        assert_eq!(err.to_string(), "timeout");
        assert!(started.elapsed() >= Duration::from_millis(50));

        let request = seen_rx.try_recv().unwrap();
        assert_eq!(bus.subscriber_count(&request.topic()), 0);
    }

    #[test]
    fn error_reply_is_passed_through_verbatim() {
        let bus = Arc::new(Bus::new());
        let responder = Arc::clone(&bus);
        bus.subscribe(REQUEST_TOPIC, move |message: &Message| {
            if let Message::RequestAbort(request) = message {
                responder.publish(
                    &request.id.topic(),
                    &Message::abort_error("operation is busy"),
                );
            }
        });

        let client = Client::new(Arc::clone(&bus));
        let err = client.abort_operation(OperationId::new()).unwrap_err();
        assert_eq!(err.to_string(), "operation is busy");
    }

    #[test]
    fn mismatched_reply_is_rejected() {
        let bus = Arc::new(Bus::new());
        let responder = Arc::clone(&bus);
        bus.subscribe(REQUEST_TOPIC, move |message: &Message| {
            if let Message::RequestList(request) = message {
                responder.publish(&request.id.topic(), &Message::abort_ok());
            }
        });

        let client = Client::new(Arc::clone(&bus));
        assert!(matches!(
            client.list_operations(),
            Err(Error::UnexpectedResponse("list"))
        ));
    }

    #[test]
    fn monitor_filters_by_operation_and_unsubscribes_on_drop() {
        let bus = Arc::new(Bus::new());
        let client = Client::new(Arc::clone(&bus));
        let watched = OperationId::new();
        let other = OperationId::new();

        let monitor = client.monitor(&[watched]);
        let mut status = OperationStatus::pending();
        for id in [other, watched] {
            bus.publish(
                &status_topic(id),
                &Message::StatusUpdate(StatusUpdate {
                    operation_id: id,
                    status: status.clone(),
                }),
            );
        }
        status.finished = true;
        status.exit_code = Some(0);
        bus.publish(
            &status_topic(watched),
            &Message::StatusUpdate(StatusUpdate {
                operation_id: watched,
                status,
            }),
        );

        let mut seen = 0;
        let terminal = monitor
            .wait_finished(&[watched], Some(Duration::from_secs(1)), |update| {
                assert_eq!(update.operation_id, watched);
                seen += 1;
            })
            .unwrap();
        assert_eq!(seen, 2);
        assert_eq!(terminal.len(), 1);

        drop(monitor);
        assert_eq!(bus.subscriber_count(&status_topic(watched)), 0);
    }

    #[test]
    fn wait_finished_honours_deadline() {
        let bus = Arc::new(Bus::new());
        let monitor = Client::new(Arc::clone(&bus)).monitor(&[]);
        let result = monitor.wait_finished(&[OperationId::new()], Some(Duration::from_millis(20)), |_| {});
        assert!(matches!(result, Err(Error::Timeout)));
    }
}
