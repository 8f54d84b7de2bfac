use tokio::sync::mpsc;

/// Number of reusable datagram buffers. Fixed for the process lifetime.
pub const NUM_BUFFERS: usize = 1000;

/// Capacity of each buffer in bytes. A datagram filling the whole buffer is
/// dropped as oversize, so this is also the largest accepted message.
pub const BUFFER_SIZE: usize = 10_000;

/// A fixed pool of reusable datagram buffers.
///
/// The receive loop is the pool's only acquirer; when every buffer is in
/// flight with a parse task, acquisition blocks. That is the process's sole
/// internal backpressure: a slow parser stalls the receive loop and overload
/// is shed at the socket. Parse tasks return buffers through a
/// [`PoolHandle`]. Cardinality never changes; every buffer taken is given
/// back exactly once.
pub struct BufferPool {
    slots: mpsc::Receiver<Vec<u8>>,
    recycle: mpsc::Sender<Vec<u8>>,
}

impl BufferPool {
    pub fn new(count: usize, capacity: usize) -> Self {
        let (recycle, slots) = mpsc::channel(count);
        for _ in 0..count {
            recycle
                .try_send(vec![0u8; capacity])
                .expect("pool channel sized to buffer count");
        }
        Self { slots, recycle }
    }

    /// Takes a buffer, waiting while all are in flight.
    pub async fn acquire(&mut self) -> Vec<u8> {
        // The pool itself holds a sender, so the channel cannot close.
        self.slots
            .recv()
            .await
            .expect("pool keeps its own recycle sender alive")
    }

    /// Number of buffers currently resting in the pool.
    pub fn available(&self) -> usize {
        self.slots.len()
    }

    /// A clone-able handle for returning buffers.
    pub fn handle(&self) -> PoolHandle {
        PoolHandle {
            recycle: self.recycle.clone(),
        }
    }
}

/// Returns buffers to their [`BufferPool`].
#[derive(Clone)]
pub struct PoolHandle {
    recycle: mpsc::Sender<Vec<u8>>,
}

impl PoolHandle {
    /// Gives a buffer back. Cannot overfill the channel: it is sized to the
    /// pool cardinality and buffers are never duplicated.
    pub fn release(&self, buf: Vec<u8>) {
        let _ = self.recycle.try_send(buf);
    }
}
