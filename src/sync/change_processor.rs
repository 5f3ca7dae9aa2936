//! Defines the long-lived thread that drains monitor events and applies
//! them to the session state, keeping the virtual tree current while a
//! filesystem is mounted.

use std::sync::{Arc, Mutex};

use crossbeam_channel::{select, Receiver, Sender};

use sourcefs::MonitorEvent;

use super::SyncState;

pub struct ChangeProcessor {
    shutdown_sender: Sender<()>,
    _thread: jod_thread::JoinHandle<()>,
}

impl ChangeProcessor {
    pub fn start(state: Arc<Mutex<SyncState>>, events: Receiver<MonitorEvent>) -> Self {
        let (shutdown_sender, shutdown_receiver) = crossbeam_channel::bounded(1);

        let thread = jod_thread::Builder::new()
            .name("tagsfs change processor".to_owned())
            .spawn(move || {
                log::trace!("ChangeProcessor thread started");
                loop {
                    select! {
                        recv(events) -> event => {
                            match event {
                                Ok(event) => {
                                    log::trace!("Monitor event: {:?}", event);
                                    state.lock().unwrap().dispatch_event(event);
                                }
                                // The monitor hung up; nothing more will
                                // ever arrive on this channel.
                                Err(_) => break,
                            }
                        },
                        recv(shutdown_receiver) -> _ => {
                            log::trace!("ChangeProcessor shutdown signal received");
                            break;
                        },
                    }
                }
            })
            .expect("Could not start ChangeProcessor thread");

        Self {
            shutdown_sender,
            _thread: thread,
        }
    }
}

impl Drop for ChangeProcessor {
    fn drop(&mut self) {
        let _ = self.shutdown_sender.send(());
    }
}
