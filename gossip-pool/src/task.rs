// Copyright 2022 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

use tokio::sync::oneshot;

pub(crate) type ShutdownRx = oneshot::Receiver<()>;
type ShutdownTx = oneshot::Sender<()>;

#[async_trait::async_trait]
pub(crate) trait Runnable {
    const NAME: &'static str;

    async fn run(self, shutdown_rx: ShutdownRx);
}

pub(crate) struct Spawner {}

impl Spawner {
    pub(crate) fn spawn_runnable<R>(runnable: R, shutdown_rx: ShutdownRx)
    where
        R: Runnable + Send + 'static,
    {
        log::info!("Running `{}`.", R::NAME);

        tokio::spawn(runnable.run(shutdown_rx));
    }
}

pub(crate) struct ShutdownBus<const N: usize> {
    senders: Vec<ShutdownTx>,
}

impl<const N: usize> ShutdownBus<N> {
    pub fn new() -> (Self, ShutdownBusRegistry) {
        let mut senders = Vec::with_capacity(N);
        let mut receivers = Vec::with_capacity(N);

        (0..N).for_each(|_| {
            let (tx, rx) = oneshot::channel::<()>();
            senders.push(tx);
            receivers.push(rx);
        });

        (Self { senders }, ShutdownBusRegistry(receivers))
    }

    pub fn trigger(self) {
        for s in self.senders {
            // A task that already terminated has dropped its receiver.
            s.send(()).ok();
        }
    }
}

pub(crate) struct ShutdownBusRegistry(Vec<ShutdownRx>);

impl ShutdownBusRegistry {
    pub fn register(&mut self) -> ShutdownRx {
        self.0.pop().expect("too many registrees")
    }
}
