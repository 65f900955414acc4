//! Pipeline assembly.
//!
//! Wires the ring buffer, transform and disk writer together and owns
//! their threads. The consumer thread is the ring's single strict
//! reader; the transform runs in its context, and completed major
//! buffers flow to the dedicated disk I/O thread over the double-buffer
//! channels.

use std::fs::File;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use anyhow::{anyhow, Context};
use tracing::{error, info};

use crate::archive::Archive;
use crate::buffer::{BlockBuffer, ReadBlock};
use crate::transform::Transform;
use crate::writer;

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Number of blocks in the sniffer ring buffer.
    pub ring_blocks: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        PipelineConfig { ring_blocks: 64 }
    }
}

/// Running archiver pipeline.
pub struct Pipeline {
    buffer: Arc<BlockBuffer>,
    consumer: Option<JoinHandle<anyhow::Result<()>>>,
    writer: Option<JoinHandle<anyhow::Result<()>>>,
}

impl Pipeline {
    /// Start the consumer and disk-writer threads against an opened
    /// archive. `write_file` is the handle from [`Archive::open`].
    pub fn start(
        archive: Arc<Archive>,
        write_file: File,
        config: &PipelineConfig,
    ) -> anyhow::Result<Self> {
        let buffer = Arc::new(BlockBuffer::new(
            archive.geometry.input_block_size,
            config.ring_blocks,
        ));

        let (request_tx, request_rx) = crossbeam_channel::bounded(2);
        let (empty_tx, empty_rx) = crossbeam_channel::bounded(2);

        // The transform seeds the empty-buffer channel with the second
        // major buffer; the writer then owns the sender for handing
        // buffers back.
        let transform = Transform::new(Arc::clone(&archive), request_tx, empty_rx, &empty_tx);

        let writer_archive = Arc::clone(&archive);
        let ring_blocks = config.ring_blocks as u32;
        let writer = thread::Builder::new()
            .name("fa-disk-writer".into())
            .spawn(move || {
                writer::run(writer_archive, write_file, request_rx, empty_tx, ring_blocks)
                    .map_err(|e| anyhow!(e))
            })
            .context("spawning disk writer thread")?;

        let consumer_buffer = Arc::clone(&buffer);
        let consumer = thread::Builder::new()
            .name("fa-transform".into())
            .spawn(move || consumer_loop(archive, consumer_buffer, transform))
            .context("spawning transform thread")?;

        Ok(Pipeline {
            buffer,
            consumer: Some(consumer),
            writer: Some(writer),
        })
    }

    pub fn buffer(&self) -> &Arc<BlockBuffer> {
        &self.buffer
    }

    /// Stop the ring and join both threads, reporting the first failure.
    pub fn shutdown(mut self) -> anyhow::Result<()> {
        self.buffer.stop();
        let mut result = Ok(());
        for handle in [self.consumer.take(), self.writer.take()].into_iter().flatten() {
            match handle.join() {
                Ok(Ok(())) => {}
                Ok(Err(err)) => {
                    error!(error = %err, "pipeline thread failed");
                    if result.is_ok() {
                        result = Err(err);
                    }
                }
                Err(_) => {
                    if result.is_ok() {
                        result = Err(anyhow!("pipeline thread panicked"));
                    }
                }
            }
        }
        result
    }
}

fn consumer_loop(
    archive: Arc<Archive>,
    buffer: Arc<BlockBuffer>,
    mut transform: Transform,
) -> anyhow::Result<()> {
    let reader = buffer.open_reader(true);
    let mut scratch = Vec::new();
    info!("transform consumer started");
    loop {
        let (block, backlog) = buffer.get_read(&reader, &mut scratch);
        archive.write_backlog.fetch_max(backlog as u32, Ordering::Relaxed);
        match block {
            ReadBlock::Data { timestamp } => {
                if let Err(err) = transform.process_block(&scratch, timestamp) {
                    // Usually a dead disk writer. Stop the ring so the
                    // producer cannot stay blocked on a consumer that no
                    // longer exists.
                    buffer.stop();
                    buffer.close_reader(reader);
                    return Err(err).context("processing block");
                }
            }
            ReadBlock::Gap => transform.process_gap(),
            ReadBlock::Shutdown => break,
        }
        buffer.release_read(&reader);
    }
    buffer.close_reader(reader);
    info!("transform consumer stopped");
    Ok(())
}
