use std::{
    net::TcpStream,
    sync::{Arc, Mutex, mpsc},
    thread::{self, JoinHandle},
};

use log::debug;

/// Fixed set of threads serving accepted connections, one connection per thread at a
/// time. Connections beyond the thread count queue up until a worker is free.
pub(crate) struct ConnectionWorkers {
    sender: Option<mpsc::Sender<TcpStream>>,
    workers: Vec<(usize, JoinHandle<()>)>,
}

impl ConnectionWorkers {
    pub fn spawn<F>(count: usize, handler: F) -> Self
    where
        F: Fn(TcpStream) + Send + Sync + 'static,
    {
        let (sender, receiver) = mpsc::channel::<TcpStream>();
        let receiver = Arc::new(Mutex::new(receiver));
        let handler = Arc::new(handler);

        let workers = (0..count)
            .map(|id| {
                let receiver = Arc::clone(&receiver);
                let handler = Arc::clone(&handler);
                let thread = thread::spawn(move || {
                    loop {
                        let next = match receiver.lock() {
                            Ok(receiver) => receiver.recv(),
                            Err(_) => break,
                        };
                        let Ok(stream) = next else {
                            debug!("worker {id} stopping");
                            break;
                        };
                        debug!("worker {id} serving {:?}", stream.peer_addr());
                        handler(stream);
                    }
                });
                (id, thread)
            })
            .collect();

        Self {
            sender: Some(sender),
            workers,
        }
    }

    pub fn dispatch(&self, stream: TcpStream) {
        if let Some(sender) = &self.sender {
            // workers hold the receiver until the sender is dropped
            let _ = sender.send(stream);
        }
    }
}

impl Drop for ConnectionWorkers {
    fn drop(&mut self) {
        drop(self.sender.take());
        for (id, thread) in self.workers.drain(..) {
            debug!("joining worker {id}");
            let _ = thread.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{
        io::{Read, Write},
        net::TcpListener,
    };

    use super::*;

    #[test]
    fn serves_queued_connections() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let address = listener.local_addr().unwrap();
        let workers = ConnectionWorkers::spawn(2, |mut stream| {
            let mut byte = [0];
            if stream.read_exact(&mut byte).is_ok() {
                let _ = stream.write_all(&[byte[0] + 1]);
            }
        });

        let clients: Vec<TcpStream> = (0..5)
            .map(|i| {
                let mut client = TcpStream::connect(address).unwrap();
                client.write_all(&[i]).unwrap();
                client
            })
            .collect();
        for _ in 0..5 {
            workers.dispatch(listener.accept().unwrap().0);
        }
        for (i, mut client) in clients.into_iter().enumerate() {
            let mut answer = [0];
            client.read_exact(&mut answer).unwrap();
            assert_eq!(usize::from(answer[0]), i + 1);
        }
    }
}
