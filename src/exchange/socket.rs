//! Unix-domain rendezvous transport. Each server-side pair binds a named
//! socket under the configured directory; clients poll `connect` against
//! the peer's name. Descriptors travel as `SCM_RIGHTS` ancillary messages
//! attached to a single marker byte, never as payload: the numeric fd is
//! only meaningful when the kernel translates it across the process
//! boundary.

use std::collections::HashMap;
use std::fs;
use std::io::{Read, Write};
use std::os::fd::{AsRawFd, BorrowedFd, FromRawFd, OwnedFd};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use std::time::Duration;

use byteorder::{ByteOrder, LittleEndian};
use nix::sys::socket::{recvmsg, sendmsg, ControlMessage, ControlMessageOwned, MsgFlags, UnixAddr};
use std::io::{IoSlice, IoSliceMut};

use super::ExchangeError;
use crate::config::RendezvousConfig;

use super::rendezvous::{HandleLink, RendezvousTransport};

const HELLO_MAGIC: u64 = 0x6363_7274_6878_6731;
const TRANSFER_TIMEOUT: Duration = Duration::from_secs(5);

fn nix_io(e: nix::errno::Errno) -> ExchangeError {
    ExchangeError::Io(std::io::Error::from_raw_os_error(e as i32))
}

pub struct UnixHandleLink {
    stream: UnixStream,
}

impl HandleLink for UnixHandleLink {
    fn send_fd(&mut self, fd: BorrowedFd) -> Result<(), ExchangeError> {
        let marker = [0xF5u8];
        let iov = [IoSlice::new(&marker)];
        let fds = [fd.as_raw_fd()];
        let cmsg = [ControlMessage::ScmRights(&fds)];
        sendmsg::<UnixAddr>(
            self.stream.as_raw_fd(),
            &iov,
            &cmsg,
            MsgFlags::empty(),
            None,
        )
        .map_err(nix_io)?;
        Ok(())
    }

    fn recv_fd(&mut self) -> Result<OwnedFd, ExchangeError> {
        let mut marker = [0u8; 1];
        let mut iov = [IoSliceMut::new(&mut marker)];
        let mut cmsg_space = nix::cmsg_space!([std::os::fd::RawFd; 1]);
        let msg = recvmsg::<UnixAddr>(
            self.stream.as_raw_fd(),
            &mut iov,
            Some(&mut cmsg_space),
            MsgFlags::empty(),
        )
        .map_err(nix_io)?;
        if msg.bytes == 0 {
            return Err(ExchangeError::ShortTransfer);
        }
        let mut received = None;
        for cmsg in msg.cmsgs() {
            if let ControlMessageOwned::ScmRights(fds) = cmsg {
                received = fds.first().copied();
            }
        }
        let raw = received.ok_or(ExchangeError::MissingDescriptor)?;
        Ok(unsafe { OwnedFd::from_raw_fd(raw) })
    }
}

pub struct UnixRendezvous {
    dir: PathBuf,
    prefix: String,
    rank: usize,
    listeners: HashMap<usize, UnixListener>,
}

fn pair_path(dir: &Path, prefix: &str, server: usize, client: usize) -> PathBuf {
    dir.join(format!("{}-{}-{}.sock", prefix, server, client))
}

impl UnixRendezvous {
    /// Binds one listener per peer this rank serves (every peer with a
    /// higher logical order). Stale socket files from a crashed run are
    /// removed before binding.
    pub fn new(
        config: &RendezvousConfig,
        scope: &str,
        rank: usize,
        peers: &[usize],
    ) -> Result<Self, ExchangeError> {
        let prefix = format!("{}-{}", config.socket_prefix, scope);
        let mut listeners = HashMap::new();
        for &peer in peers.iter().filter(|&&p| p > rank) {
            let path = pair_path(&config.socket_dir, &prefix, rank, peer);
            match fs::remove_file(&path) {
                Ok(_) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(ExchangeError::Io(e)),
            }
            let listener = UnixListener::bind(&path)?;
            listener.set_nonblocking(true)?;
            listeners.insert(peer, listener);
        }
        Ok(UnixRendezvous {
            dir: config.socket_dir.clone(),
            prefix,
            rank,
            listeners,
        })
    }
}

impl RendezvousTransport for UnixRendezvous {
    type Link = UnixHandleLink;

    fn try_accept(&mut self, peer: usize) -> Result<Option<UnixHandleLink>, ExchangeError> {
        let listener = self
            .listeners
            .get(&peer)
            .ok_or(ExchangeError::UnknownPeer(peer))?;
        match listener.accept() {
            Ok((mut stream, _)) => {
                stream.set_nonblocking(false)?;
                stream.set_read_timeout(Some(TRANSFER_TIMEOUT))?;
                let mut buf = [0u8; 8];
                stream.read_exact(&mut buf)?;
                let got = LittleEndian::read_u64(&buf);
                if got != HELLO_MAGIC {
                    log::warn!("rendezvous accept: invalid magic {:#x}", got);
                    return Ok(None);
                }
                Ok(Some(UnixHandleLink { stream }))
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => Ok(None),
            Err(e) => Err(ExchangeError::Io(e)),
        }
    }

    fn try_connect(&mut self, peer: usize) -> Result<Option<UnixHandleLink>, ExchangeError> {
        let path = pair_path(&self.dir, &self.prefix, peer, self.rank);
        match UnixStream::connect(&path) {
            Ok(mut stream) => {
                stream.set_read_timeout(Some(TRANSFER_TIMEOUT))?;
                let mut buf = [0u8; 8];
                LittleEndian::write_u64(&mut buf, HELLO_MAGIC);
                stream.write_all(&buf)?;
                Ok(Some(UnixHandleLink { stream }))
            }
            Err(e)
                if matches!(
                    e.kind(),
                    std::io::ErrorKind::NotFound | std::io::ErrorKind::ConnectionRefused
                ) =>
            {
                Ok(None)
            }
            Err(e) => Err(ExchangeError::Io(e)),
        }
    }

    fn teardown(&mut self) -> Result<(), ExchangeError> {
        for (peer, listener) in self.listeners.drain() {
            let path = pair_path(&self.dir, &self.prefix, self.rank, peer);
            drop(listener);
            match fs::remove_file(&path) {
                Ok(_) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(ExchangeError::Io(e)),
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::fd::AsFd;
    use std::sync::atomic::{AtomicU64, Ordering};

    static SCOPE: AtomicU64 = AtomicU64::new(0);

    fn test_config() -> (RendezvousConfig, String) {
        let scope = format!(
            "t{}-{}",
            std::process::id(),
            SCOPE.fetch_add(1, Ordering::Relaxed)
        );
        (RendezvousConfig::default(), scope)
    }

    #[test]
    fn fd_crosses_a_socketpair() {
        let (config, scope) = test_config();
        let mut server = UnixRendezvous::new(&config, &scope, 0, &[1]).unwrap();
        let mut client = UnixRendezvous::new(&config, &scope, 1, &[0]).unwrap();

        assert!(server.try_accept(1).unwrap().is_none());
        let mut client_link = client.try_connect(0).unwrap().unwrap();
        let mut server_link = loop {
            if let Some(link) = server.try_accept(1).unwrap() {
                break link;
            }
        };

        let driver = crate::driver::fake::FakeDriver::new();
        use crate::driver::{DeviceDriver, DevicePtr};
        let fd = driver.export_memory_handle(DevicePtr(0xabcd)).unwrap();
        server_link.send_fd(fd.as_fd()).unwrap();
        let received = client_link.recv_fd().unwrap();
        assert_eq!(
            driver.import_memory_handle(received).unwrap(),
            DevicePtr(0xabcd)
        );

        server.teardown().unwrap();
        client.teardown().unwrap();
    }

    #[test]
    fn connect_without_listener_reports_not_ready() {
        let (config, scope) = test_config();
        let mut client = UnixRendezvous::new(&config, &scope, 1, &[0]).unwrap();
        assert!(client.try_connect(0).unwrap().is_none());
    }

    #[test]
    fn teardown_unlinks_the_endpoint() {
        let (config, scope) = test_config();
        let mut server = UnixRendezvous::new(&config, &scope, 0, &[1]).unwrap();
        let path = pair_path(
            &config.socket_dir,
            &format!("{}-{}", config.socket_prefix, scope),
            0,
            1,
        );
        assert!(path.exists());
        server.teardown().unwrap();
        assert!(!path.exists());
    }
}
