use std::thread;

use crossbeam_channel::{Receiver, Sender, bounded};

enum Batch<T> {
    Items(Vec<T>),
    /// End of stream. Kept apart from the data so no item can be mistaken for it.
    End,
}

/// Drives an iterator on its own thread and hands its items over in batches.
///
/// At most `buffer_size` batches of `chunk_size` items wait in the queue; the
/// producer blocks once it is full. Items come out in the order the wrapped
/// iterator produced them. Dropping the wrapper stops the producer at its next
/// batch.
pub struct Buffered<T> {
    name: String,
    receiver: Receiver<Batch<T>>,
    current: std::vec::IntoIter<T>,
    done: bool,
}

impl<T: Send + 'static> Buffered<T> {
    pub fn spawn<I>(
        name: &str,
        items: I,
        buffer_size: usize,
        chunk_size: usize,
    ) -> std::io::Result<Self>
    where
        I: Iterator<Item = T> + Send + 'static,
    {
        let (sender, receiver) = bounded(buffer_size.max(1));
        let chunk_size = chunk_size.max(1);

        let thread_name = name.to_string();
        thread::Builder::new()
            .name(name.to_string())
            .spawn(move || produce(&thread_name, items, sender, chunk_size))?;

        Ok(Self {
            name: name.to_string(),
            receiver,
            current: Vec::new().into_iter(),
            done: false,
        })
    }
}

fn produce<T, I>(name: &str, items: I, sender: Sender<Batch<T>>, chunk_size: usize)
where
    I: Iterator<Item = T>,
{
    let mut items = items.fuse();
    loop {
        let batch: Vec<T> = items.by_ref().take(chunk_size).collect();
        if batch.is_empty() {
            let _ = sender.send(Batch::End);
            return;
        }
        if sender.send(Batch::Items(batch)).is_err() {
            log::debug!("{}: consumer went away, stopping", name);
            return;
        }
    }
}

impl<T> Iterator for Buffered<T> {
    type Item = T;

    fn next(&mut self) -> Option<T> {
        loop {
            if let Some(item) = self.current.next() {
                return Some(item);
            }
            if self.done {
                return None;
            }

            match self.receiver.recv() {
                Ok(Batch::Items(items)) => self.current = items.into_iter(),
                Ok(Batch::End) => self.done = true,
                Err(_) => {
                    log::error!("{}: producer stopped before the end of its stream", self.name);
                    self.done = true;
                }
            }
        }
    }
}

#[cfg(test)]
#[path = "buffered_test.rs"]
mod buffered_test;
