//! The optional TAP device bridging the overlay to the host network stack.
//!
//! A dedicated thread blocks on the device and forwards complete Ethernet
//! frames over a channel into the event loop; writes happen directly from
//! the loop thread. Only unicast frames are bridged; the overlay has no
//! broadcast domain.

use sparkle_crypto::OverlayMac;

#[cfg(target_os = "linux")]
const FRAME_BUFFER_SIZE: usize = 65536;

#[cfg(target_os = "linux")]
mod imp {
    use std::{
        io,
        sync::{
            mpsc::{self, Receiver},
            Arc,
        },
        thread,
    };

    use sparkle_crypto::OverlayMac;
    use tun_tap::{Iface, Mode};

    use super::FRAME_BUFFER_SIZE;

    pub struct Tap {
        iface: Arc<Iface>,
        frames: Receiver<Vec<u8>>,
    }

    impl Tap {
        pub fn open(overlay_mac: OverlayMac) -> io::Result<Self> {
            let iface = Arc::new(Iface::without_packet_info("sparkle%d", Mode::Tap)?);
            log::info!(
                "tap: created interface {}; its link address should be set to {overlay_mac}",
                iface.name()
            );

            let (tx, frames) = mpsc::channel();
            let reader = Arc::clone(&iface);
            thread::Builder::new()
                .name("sparkle-tap".into())
                .spawn(move || {
                    let mut buffer = [0u8; FRAME_BUFFER_SIZE];
                    loop {
                        match reader.recv(&mut buffer) {
                            Ok(len) => {
                                if tx.send(buffer[..len].to_vec()).is_err() {
                                    break;
                                }
                            }
                            Err(error) => {
                                log::warn!("tap: read failed: {error}");
                                break;
                            }
                        }
                    }
                })?;

            Ok(Self { iface, frames })
        }

        pub fn try_recv(&self) -> Option<Vec<u8>> {
            self.frames.try_recv().ok()
        }

        pub fn write(&self, frame: &[u8]) -> io::Result<()> {
            self.iface.send(frame).map(|_| ())
        }
    }
}

#[cfg(not(target_os = "linux"))]
mod imp {
    use std::io;

    use sparkle_crypto::OverlayMac;

    pub struct Tap {}

    impl Tap {
        pub fn open(_overlay_mac: OverlayMac) -> io::Result<Self> {
            Err(io::Error::new(
                io::ErrorKind::Unsupported,
                "TAP bridging is only available on Linux; run with --no-tap",
            ))
        }

        pub fn try_recv(&self) -> Option<Vec<u8>> {
            None
        }

        pub fn write(&self, _frame: &[u8]) -> io::Result<()> {
            Ok(())
        }
    }
}

pub use imp::Tap;

/// The destination overlay address of an Ethernet frame, when it is a
/// bridgeable unicast frame.
pub fn unicast_dest(frame: &[u8]) -> Option<OverlayMac> {
    let octets: [u8; 6] = frame.get(..6)?.try_into().ok()?;
    if octets[0] & 0x01 != 0 {
        return None;
    }
    Some(OverlayMac::from_octets(octets))
}
