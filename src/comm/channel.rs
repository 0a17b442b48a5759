//! Channel-mesh communicator: one crossbeam channel per ordered rank pair.
//!
//! Within a worker everything is single-threaded, so per-pair message order
//! is deterministic and tag assertions are enough to catch mispairings.

use crossbeam_channel::{unbounded, Receiver, Sender};

use super::{Communicator, Tag};
use crate::errors::{PintError, PintResult};

struct Message {
    tag: Tag,
    data: Vec<f64>,
}

pub struct ChannelComm {
    rank: usize,
    size: usize,
    /// `tx[j]` sends to rank `j`.
    tx: Vec<Sender<Message>>,
    /// `rx[j]` receives from rank `j`.
    rx: Vec<Receiver<Message>>,
}

/// Build a fully connected mesh of `size` communicators, one per worker.
pub fn mesh(size: usize) -> Vec<ChannelComm> {
    let mut senders: Vec<Vec<Option<Sender<Message>>>> = (0..size)
        .map(|_| (0..size).map(|_| None).collect())
        .collect();
    let mut receivers: Vec<Vec<Option<Receiver<Message>>>> = (0..size)
        .map(|_| (0..size).map(|_| None).collect())
        .collect();

    for from in 0..size {
        for to in 0..size {
            let (tx, rx) = unbounded();
            senders[from][to] = Some(tx);
            receivers[to][from] = Some(rx);
        }
    }

    senders
        .into_iter()
        .zip(receivers)
        .enumerate()
        .map(|(rank, (tx, rx))| ChannelComm {
            rank,
            size,
            tx: tx.into_iter().map(|s| s.expect("mesh sender")).collect(),
            rx: rx.into_iter().map(|r| r.expect("mesh receiver")).collect(),
        })
        .collect()
}

impl Communicator for ChannelComm {
    fn rank(&self) -> usize {
        self.rank
    }

    fn size(&self) -> usize {
        self.size
    }

    fn send(&self, dest: usize, tag: Tag, data: &[f64]) -> PintResult<()> {
        self.tx
            .get(dest)
            .ok_or_else(|| PintError::Comm(format!("send to unknown rank {dest}")))?
            .send(Message { tag, data: data.to_vec() })
            .map_err(|_| PintError::Comm(format!("rank {dest} hung up")))
    }

    fn recv(&self, src: usize, tag: Tag) -> PintResult<Vec<f64>> {
        let msg = self
            .rx
            .get(src)
            .ok_or_else(|| PintError::Comm(format!("recv from unknown rank {src}")))?
            .recv()
            .map_err(|_| PintError::Comm(format!("rank {src} hung up")))?;
        if msg.tag != tag {
            return Err(PintError::Comm(format!(
                "tag mismatch from rank {src}: expected {tag:?}, got {:?}",
                msg.tag
            )));
        }
        Ok(msg.data)
    }

    fn broadcast(&self, root: usize, data: &mut Vec<f64>) -> PintResult<()> {
        if self.rank == root {
            for dest in 0..self.size {
                if dest != root {
                    self.send(dest, Tag::Collective, data)?;
                }
            }
        } else {
            *data = self.recv(root, Tag::Collective)?;
        }
        Ok(())
    }

    fn scatterv(&self, root: usize, send: Option<&[f64]>, counts: &[usize]) -> PintResult<Vec<f64>> {
        if self.rank == root {
            let send = send.ok_or_else(|| PintError::Comm("scatter without send buffer".into()))?;
            let total: usize = counts.iter().sum();
            if send.len() != total {
                return Err(PintError::Comm(format!(
                    "scatter buffer holds {} reals, counts sum to {total}",
                    send.len()
                )));
            }
            let mut offset = 0;
            let mut own = Vec::new();
            for (dest, &count) in counts.iter().enumerate() {
                let chunk = &send[offset..offset + count];
                if dest == root {
                    own = chunk.to_vec();
                } else {
                    self.send(dest, Tag::Collective, chunk)?;
                }
                offset += count;
            }
            Ok(own)
        } else {
            self.recv(root, Tag::Collective)
        }
    }

    fn gatherv(&self, root: usize, data: &[f64]) -> PintResult<Option<Vec<f64>>> {
        if self.rank == root {
            let mut out = Vec::new();
            for src in 0..self.size {
                if src == root {
                    out.extend_from_slice(data);
                } else {
                    out.extend(self.recv(src, Tag::Collective)?);
                }
            }
            Ok(Some(out))
        } else {
            self.send(root, Tag::Collective, data)?;
            Ok(None)
        }
    }

    fn allreduce_sum(&self, x: f64) -> PintResult<f64> {
        let gathered = self.gatherv(0, &[x])?;
        let mut sum = vec![gathered.map(|v| v.iter().sum()).unwrap_or(0.0)];
        self.broadcast(0, &mut sum)?;
        Ok(sum[0])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn allreduce_sums_across_ranks() {
        let comms = mesh(3);
        let handles: Vec<_> = comms
            .into_iter()
            .map(|comm| {
                thread::spawn(move || comm.allreduce_sum(comm.rank() as f64 + 1.0).unwrap())
            })
            .collect();
        for h in handles {
            assert_eq!(h.join().unwrap(), 6.0);
        }
    }

    #[test]
    fn scatter_gather_round_trip() {
        let comms = mesh(2);
        let handles: Vec<_> = comms
            .into_iter()
            .map(|comm| {
                thread::spawn(move || {
                    let counts = [2, 3];
                    let send = if comm.rank() == 0 {
                        Some(vec![1.0, 2.0, 3.0, 4.0, 5.0])
                    } else {
                        None
                    };
                    let local = comm.scatterv(0, send.as_deref(), &counts).unwrap();
                    let gathered = comm.gatherv(0, &local).unwrap();
                    if comm.rank() == 0 {
                        assert_eq!(gathered.unwrap(), vec![1.0, 2.0, 3.0, 4.0, 5.0]);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
    }

    #[test]
    fn tag_mismatch_is_an_error() {
        let comms = mesh(2);
        let mut it = comms.into_iter();
        let c0 = it.next().unwrap();
        let c1 = it.next().unwrap();
        c0.send(1, Tag::Halo, &[1.0]).unwrap();
        assert!(c1.recv(0, Tag::Collective).is_err());
    }
}
