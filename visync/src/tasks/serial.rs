use anyhow::anyhow;
use log::{debug, info, warn};
use pretty_hex::simple_hex;
use tokio::{
    io::{AsyncRead, AsyncReadExt},
    sync::mpsc,
    time,
};
use tokio_serial::SerialPortBuilderExt;

use crate::{
    backoff::Backoff,
    dispatch::Dispatcher,
    midi::{DecodeError, Decoder},
    Event, InputSource, Result, VisyncError,
};

/// Reads raw MIDI bytes from a serial port or device node and turns them
/// into events. The port is reopened with backoff when it fails.
pub(crate) struct SerialTask {
    source: InputSource,
    decoder: Decoder,
    dispatcher: Dispatcher,
    event_tx: mpsc::Sender<Event>,
    backoff: Backoff,
}

fn log_decode_error(e: &DecodeError) {
    if cfg!(feature = "log_bad_bytes") {
        warn!(target: "visync", "{}\n{}", e, pretty_hex::pretty_hex(&e.dropped()));
    } else {
        debug!(target: "visync", "{} [{}]", e, simple_hex(&e.dropped()));
    }
}

impl SerialTask {
    pub(crate) fn new(
        source: InputSource,
        dispatcher: Dispatcher,
        event_tx: mpsc::Sender<Event>,
    ) -> SerialTask {
        SerialTask {
            source,
            decoder: Decoder::new(),
            dispatcher,
            event_tx,
            backoff: Backoff::default(),
        }
    }

    pub(crate) async fn run(mut self) -> Result<()> {
        loop {
            let res = match self.open().await {
                Ok(reader) => {
                    info!("reading midi from {:?}", self.source);
                    self.backoff.reset();
                    self.read_stream(reader).await
                }
                Err(e) => Err(e),
            };

            match res {
                Ok(()) => warn!("midi input {:?} closed", self.source),
                Err(VisyncError::Terminating) => return Ok(()),
                Err(e) => warn!("midi input {:?} failed: {}", self.source, e),
            }

            let delay = self.backoff.next_delay();
            info!("reopening midi input in {:?}", delay);
            tokio::select! {
                _ = self.event_tx.closed() => return Ok(()),
                _ = time::sleep(delay) => {}
            }
        }
    }

    async fn open(&self) -> Result<Box<dyn AsyncRead + Unpin + Send>> {
        match &self.source {
            InputSource::Serial { path, baud } => {
                let port = tokio_serial::new(path.as_str(), *baud).open_native_async()?;
                Ok(Box::new(port))
            }
            InputSource::Raw { path } => Ok(Box::new(tokio::fs::File::open(path).await?)),
            InputSource::Fake { .. } => Err(anyhow!("fake input has no byte stream").into()),
        }
    }

    /// Returns `Ok` at end of stream.
    pub(crate) async fn read_stream<R: AsyncRead + Unpin>(&mut self, mut reader: R) -> Result<()> {
        let mut buf = [0; 256];
        loop {
            tokio::select! {
                _ = self.event_tx.closed() => {
                    return Err(VisyncError::Terminating);
                }
                res = reader.read(&mut buf) => {
                    let len = res?;
                    if len == 0 {
                        return Ok(());
                    }
                    for b in &buf[0..len] {
                        self.handle_byte(*b).await?;
                    }
                }
            }
        }
    }

    async fn handle_byte(&mut self, b: u8) -> Result<()> {
        match self.decoder.feed(b) {
            Ok(Some(frame)) => {
                if let Some(event) = self.dispatcher.dispatch(&frame) {
                    self.event_tx
                        .send(event)
                        .await
                        .map_err(|_| VisyncError::Terminating)?;
                }
            }
            Ok(None) => (),
            Err(e) => log_decode_error(&e),
        }
        Ok(())
    }
}
