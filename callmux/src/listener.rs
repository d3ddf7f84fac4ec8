use std::{net::SocketAddr, sync::Arc};

use crate::{Channel, ChannelConfig, Dispatcher, Error, ErrorKind, Result, TaskSupervisor};

/// TCP accept loop handing every connection to a [`Dispatcher`].
pub struct Listener {
    task_supervisor: TaskSupervisor,
}

impl Default for Listener {
    fn default() -> Self {
        Self::new()
    }
}

impl Listener {
    #[must_use]
    pub fn new() -> Self {
        Self {
            task_supervisor: TaskSupervisor::create(),
        }
    }

    /// # Errors
    ///
    /// Returns `TcpBindFailed` if `addr` cannot be bound.
    pub async fn start_listen(
        &self,
        addr: SocketAddr,
        dispatcher: &Arc<Dispatcher>,
        config: &ChannelConfig,
    ) -> Result<SocketAddr> {
        let listener = tokio::net::TcpListener::bind(addr)
            .await
            .map_err(|e| Error::new(ErrorKind::TcpBindFailed, e.to_string()))?;
        let listener_addr = listener
            .local_addr()
            .map_err(|e| Error::new(ErrorKind::TcpBindFailed, e.to_string()))?;
        let dispatcher = dispatcher.clone();
        let config = config.clone();

        self.task_supervisor.spawn(|guard| async move {
            tokio::select! {
                () = guard.stopped() => {
                    tracing::info!("stop accept loop");
                }
                () = async {
                    tracing::info!("start listening: {listener_addr}");
                    loop {
                        match listener.accept().await {
                            Ok((stream, peer)) => {
                                tracing::debug!("accept connection from {peer}");
                                if let Err(e) = stream.set_nodelay(true) {
                                    tracing::warn!("set nodelay for {peer} failed: {e}");
                                }
                                dispatcher.serve(Channel::new(stream, &config));
                            }
                            Err(e) => {
                                tracing::error!("accept failed: {e}");
                                break;
                            }
                        }
                    }
                } => {}
            }
        });

        Ok(listener_addr)
    }

    pub fn stop(&self) {
        self.task_supervisor.stop();
    }

    pub async fn join(&self) {
        self.task_supervisor.all_stopped().await;
    }
}
