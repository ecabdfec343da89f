//! TCP client for the external approval service.

use std::io;
use std::net::{SocketAddr, TcpStream};
use std::time::{Duration, Instant};

use plan_kernel_core::approval::{
    read_frame, write_frame, ApprovalMessage, ApprovalOracle, ApprovalRequest, ApprovalVerdict,
};
use plan_kernel_core::KernelError;

/// Talks to an approval service listening on a local TCP port. Heartbeats
/// received while waiting are skipped.
#[derive(Debug, Clone)]
pub struct TcpApprovalOracle {
    addr: SocketAddr,
}

impl TcpApprovalOracle {
    #[must_use]
    pub fn new(addr: SocketAddr) -> Self {
        Self { addr }
    }

    fn exchange(&self, request: &ApprovalRequest, timeout: Duration) -> io::Result<ApprovalVerdict> {
        let deadline = Instant::now().checked_add(timeout).ok_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidInput, "approval timeout out of range")
        })?;
        let mut stream = TcpStream::connect_timeout(&self.addr, timeout)?;
        stream.set_write_timeout(Some(timeout))?;
        write_frame(&mut stream, &request.clone().into_message())?;

        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(io::Error::new(io::ErrorKind::TimedOut, "approval deadline passed"));
            }
            stream.set_read_timeout(Some(remaining))?;
            match read_frame(&mut stream)? {
                ApprovalMessage::CommandResponse {
                    request_id,
                    approved,
                    responder,
                    comment,
                } if request_id == request.request_id => {
                    return Ok(ApprovalVerdict {
                        approved,
                        responder,
                        comment,
                    });
                }
                ApprovalMessage::Heartbeat { .. } | ApprovalMessage::CommandResponse { .. } => {}
                ApprovalMessage::CommandRequest { .. } => {
                    return Err(io::Error::new(
                        io::ErrorKind::InvalidData,
                        "approval service sent a command_request",
                    ));
                }
            }
        }
    }
}

impl ApprovalOracle for TcpApprovalOracle {
    fn request_approval(
        &self,
        request: &ApprovalRequest,
        timeout: Duration,
    ) -> Result<ApprovalVerdict, KernelError> {
        self.exchange(request, timeout).map_err(|err| {
            KernelError::ConfirmationRequired(format!(
                "no approval verdict from {} for request {}: {err}",
                self.addr, request.request_id
            ))
        })
    }
}
