//! Control surface of the external compositing pipeline
//!
//! The relay never touches video. It only tells the compositor where each
//! input sits in the output grid, whether it is visible, which socket feeds
//! each input, and which port to send the composited stream to.

use std::io::{self, IoSlice, Write};
use std::net::SocketAddr;
use std::os::fd::{AsRawFd, BorrowedFd, RawFd};
use std::os::unix::net::UnixStream;
use std::path::Path;

use nix::sys::socket::{sendmsg, ControlMessage, MsgFlags, UnixAddr};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::Result;

use super::identity::{EndpointIndex, MAX_CLIENTS};

/// Top-left corner of a grid cell, in output pixels
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GridPoint {
    pub x: u32,
    pub y: u32,
}

impl GridPoint {
    pub const ORIGIN: GridPoint = GridPoint { x: 0, y: 0 };

    pub fn new(x: u32, y: u32) -> Self {
        Self { x, y }
    }
}

/// Operations the relay invokes on the compositing subsystem
///
/// Calls are synchronous and infallible from the relay's point of view;
/// an implementation that can fail reports it through logging.
pub trait Compositor {
    /// Internal endpoint `input` is bound at `addr`
    ///
    /// `socket` is the bound endpoint socket itself. The compositor input
    /// must read from this socket; nothing else can bind its address.
    fn attach_input(&mut self, input: EndpointIndex, addr: SocketAddr, socket: BorrowedFd<'_>);

    /// Composited output must be sent to this local port
    fn set_output_port(&mut self, port: u16);

    fn set_position(&mut self, input: EndpointIndex, point: GridPoint);

    /// Opacity in `[0, 1]`
    fn set_alpha(&mut self, input: EndpointIndex, alpha: f64);
}

impl<T: Compositor + ?Sized> Compositor for Box<T> {
    fn attach_input(&mut self, input: EndpointIndex, addr: SocketAddr, socket: BorrowedFd<'_>) {
        (**self).attach_input(input, addr, socket)
    }

    fn set_output_port(&mut self, port: u16) {
        (**self).set_output_port(port)
    }

    fn set_position(&mut self, input: EndpointIndex, point: GridPoint) {
        (**self).set_position(input, point)
    }

    fn set_alpha(&mut self, input: EndpointIndex, alpha: f64) {
        (**self).set_alpha(input, alpha)
    }
}

/// Current state of one compositor input
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct InputLayout {
    pub addr: Option<SocketAddr>,
    pub position: GridPoint,
    pub alpha: f64,
}

impl InputLayout {
    pub fn is_visible(&self) -> bool {
        self.alpha > 0.0
    }
}

/// In-memory compositor model
///
/// Tracks what the pipeline has been told and logs every change.
#[derive(Debug, Default)]
pub struct LayoutCompositor {
    inputs: [InputLayout; MAX_CLIENTS],
    output_port: Option<u16>,
}

impl LayoutCompositor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn layout(&self, input: EndpointIndex) -> Option<&InputLayout> {
        self.inputs.get(input.0)
    }

    pub fn output_port(&self) -> Option<u16> {
        self.output_port
    }

    /// Inputs currently shown, in input order
    pub fn visible_inputs(&self) -> Vec<EndpointIndex> {
        self.inputs
            .iter()
            .enumerate()
            .filter(|(_, layout)| layout.is_visible())
            .map(|(i, _)| EndpointIndex(i))
            .collect()
    }

    fn input_mut(&mut self, input: EndpointIndex) -> Option<&mut InputLayout> {
        let slot = self.inputs.get_mut(input.0);
        if slot.is_none() {
            warn!("Ignoring compositor call for unknown {}", input);
        }
        slot
    }
}

impl Compositor for LayoutCompositor {
    fn attach_input(&mut self, input: EndpointIndex, addr: SocketAddr, _socket: BorrowedFd<'_>) {
        if let Some(layout) = self.input_mut(input) {
            layout.addr = Some(addr);
            debug!("Compositor {} reads from {}", input, addr);
        }
    }

    fn set_output_port(&mut self, port: u16) {
        self.output_port = Some(port);
        debug!("Compositor output port set to {}", port);
    }

    fn set_position(&mut self, input: EndpointIndex, point: GridPoint) {
        if let Some(layout) = self.input_mut(input) {
            layout.position = point;
            debug!("Compositor {} moved to ({}, {})", input, point.x, point.y);
        }
    }

    fn set_alpha(&mut self, input: EndpointIndex, alpha: f64) {
        if let Some(layout) = self.input_mut(input) {
            layout.alpha = alpha.clamp(0.0, 1.0);
            debug!("Compositor {} alpha set to {}", input, layout.alpha);
        }
    }
}

/// One control call, as written by [`CommandWriter`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum CompositorCommand {
    AttachInput { input: usize, addr: SocketAddr },
    SetOutputPort { port: u16 },
    SetPosition { input: usize, x: u32, y: u32 },
    SetAlpha { input: usize, alpha: f64 },
}

fn encode_line(command: &CompositorCommand) -> io::Result<Vec<u8>> {
    let mut line = serde_json::to_vec(command)?;
    line.push(b'\n');
    Ok(line)
}

/// Compositor that streams control calls as JSON lines
///
/// A file or FIFO cannot carry the endpoint sockets, so a reader only
/// learns their addresses. Use [`ControlSocket`] for a pipeline that has
/// to consume the forwarded video.
pub struct CommandWriter<W: Write> {
    writer: W,
    failed: bool,
}

impl<W: Write> CommandWriter<W> {
    pub fn new(writer: W) -> Self {
        Self {
            writer,
            failed: false,
        }
    }

    pub fn into_inner(self) -> W {
        self.writer
    }

    fn emit(&mut self, command: CompositorCommand) {
        let result = encode_line(&command)
            .and_then(|line| self.writer.write_all(&line))
            .and_then(|_| self.writer.flush());

        match result {
            Ok(()) => self.failed = false,
            // Only the first failure of a run is reported
            Err(e) if !self.failed => {
                warn!("Failed to write compositor command {:?}: {}", command, e);
                self.failed = true;
            }
            Err(_) => {}
        }
    }
}

impl<W: Write> Compositor for CommandWriter<W> {
    fn attach_input(&mut self, input: EndpointIndex, addr: SocketAddr, _socket: BorrowedFd<'_>) {
        self.emit(CompositorCommand::AttachInput {
            input: input.0,
            addr,
        });
    }

    fn set_output_port(&mut self, port: u16) {
        self.emit(CompositorCommand::SetOutputPort { port });
    }

    fn set_position(&mut self, input: EndpointIndex, point: GridPoint) {
        self.emit(CompositorCommand::SetPosition {
            input: input.0,
            x: point.x,
            y: point.y,
        });
    }

    fn set_alpha(&mut self, input: EndpointIndex, alpha: f64) {
        self.emit(CompositorCommand::SetAlpha {
            input: input.0,
            alpha,
        });
    }
}

/// Compositor driven over a Unix stream socket
///
/// Sends the same JSON lines as [`CommandWriter`]. Each `attach_input`
/// line also carries the endpoint socket as `SCM_RIGHTS` ancillary data,
/// so the pipeline process reads the forwarded video from the very socket
/// the relay sends it to.
pub struct ControlSocket {
    stream: UnixStream,
    failed: bool,
}

impl ControlSocket {
    /// Connect to a pipeline listening on `path`
    pub fn connect(path: &Path) -> Result<Self> {
        let stream = UnixStream::connect(path)?;
        info!("Connected to compositor control socket {}", path.display());
        Ok(Self::from_stream(stream))
    }

    pub fn from_stream(stream: UnixStream) -> Self {
        Self {
            stream,
            failed: false,
        }
    }

    fn emit(&mut self, command: CompositorCommand, socket: Option<BorrowedFd<'_>>) {
        let result = encode_line(&command).and_then(|line| self.send_line(&line, socket));

        match result {
            Ok(()) => self.failed = false,
            Err(e) if !self.failed => {
                warn!("Failed to send compositor command {:?}: {}", command, e);
                self.failed = true;
            }
            Err(_) => {}
        }
    }

    fn send_line(&mut self, line: &[u8], socket: Option<BorrowedFd<'_>>) -> io::Result<()> {
        let fds: Vec<RawFd> = socket.iter().map(|fd| fd.as_raw_fd()).collect();
        let cmsgs: Vec<ControlMessage<'_>> = if fds.is_empty() {
            Vec::new()
        } else {
            vec![ControlMessage::ScmRights(&fds)]
        };

        // The descriptor rides on the first byte; the rest is plain stream data
        let sent = sendmsg::<UnixAddr>(
            self.stream.as_raw_fd(),
            &[IoSlice::new(line)],
            &cmsgs,
            MsgFlags::MSG_NOSIGNAL,
            None,
        )?;
        self.stream.write_all(&line[sent..])
    }
}

impl Compositor for ControlSocket {
    fn attach_input(&mut self, input: EndpointIndex, addr: SocketAddr, socket: BorrowedFd<'_>) {
        self.emit(
            CompositorCommand::AttachInput {
                input: input.0,
                addr,
            },
            Some(socket),
        );
    }

    fn set_output_port(&mut self, port: u16) {
        self.emit(CompositorCommand::SetOutputPort { port }, None);
    }

    fn set_position(&mut self, input: EndpointIndex, point: GridPoint) {
        self.emit(
            CompositorCommand::SetPosition {
                input: input.0,
                x: point.x,
                y: point.y,
            },
            None,
        );
    }

    fn set_alpha(&mut self, input: EndpointIndex, alpha: f64) {
        self.emit(
            CompositorCommand::SetAlpha {
                input: input.0,
                alpha,
            },
            None,
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::IoSliceMut;
    use std::net::UdpSocket;
    use std::os::fd::{AsFd, FromRawFd};
    use std::time::Duration;

    use nix::sys::socket::{recvmsg, ControlMessageOwned};

    #[test]
    fn test_layout_tracks_calls() {
        let mut compositor = LayoutCompositor::new();
        let endpoint = UdpSocket::bind("127.0.0.1:0").unwrap();
        let addr = endpoint.local_addr().unwrap();

        compositor.attach_input(EndpointIndex(1), addr, endpoint.as_fd());
        compositor.set_output_port(41000);
        compositor.set_position(EndpointIndex(1), GridPoint::new(320, 240));
        compositor.set_alpha(EndpointIndex(1), 1.0);

        let layout = compositor.layout(EndpointIndex(1)).unwrap();
        assert_eq!(layout.addr, Some(addr));
        assert_eq!(layout.position, GridPoint::new(320, 240));
        assert!(layout.is_visible());
        assert_eq!(compositor.output_port(), Some(41000));
        assert_eq!(compositor.visible_inputs(), vec![EndpointIndex(1)]);
    }

    #[test]
    fn test_layout_ignores_unknown_input() {
        let mut compositor = LayoutCompositor::new();
        compositor.set_alpha(EndpointIndex(MAX_CLIENTS), 1.0);
        assert!(compositor.visible_inputs().is_empty());
        assert!(compositor.layout(EndpointIndex(MAX_CLIENTS)).is_none());
    }

    #[test]
    fn test_alpha_is_clamped() {
        let mut compositor = LayoutCompositor::new();
        compositor.set_alpha(EndpointIndex(0), 3.5);
        assert_eq!(compositor.layout(EndpointIndex(0)).unwrap().alpha, 1.0);
        compositor.set_alpha(EndpointIndex(0), -1.0);
        assert!(!compositor.layout(EndpointIndex(0)).unwrap().is_visible());
    }

    #[test]
    fn test_command_writer_emits_json_lines() {
        let mut writer = CommandWriter::new(Vec::new());
        writer.set_output_port(5004);
        writer.set_position(EndpointIndex(2), GridPoint::new(0, 240));
        writer.set_alpha(EndpointIndex(2), 0.0);

        let output = String::from_utf8(writer.into_inner()).unwrap();
        let commands: Vec<CompositorCommand> = output
            .lines()
            .map(|line| serde_json::from_str(line).unwrap())
            .collect();

        assert_eq!(
            commands,
            vec![
                CompositorCommand::SetOutputPort { port: 5004 },
                CompositorCommand::SetPosition { input: 2, x: 0, y: 240 },
                CompositorCommand::SetAlpha { input: 2, alpha: 0.0 },
            ]
        );
        assert!(output.starts_with(r#"{"command":"set_output_port","port":5004}"#));
    }

    #[test]
    fn test_control_socket_hands_over_endpoint_socket() {
        let (relay_side, pipeline_side) = UnixStream::pair().unwrap();
        let endpoint = UdpSocket::bind("127.0.0.1:0").unwrap();
        let endpoint_addr = endpoint.local_addr().unwrap();

        let mut control = ControlSocket::from_stream(relay_side);
        control.attach_input(EndpointIndex(3), endpoint_addr, endpoint.as_fd());

        let mut buf = [0u8; 256];
        let mut cmsg_buffer = nix::cmsg_space!([RawFd; 1]);
        let (len, fds) = {
            let mut iov = [IoSliceMut::new(&mut buf)];
            let msg = recvmsg::<UnixAddr>(
                pipeline_side.as_raw_fd(),
                &mut iov,
                Some(&mut cmsg_buffer),
                MsgFlags::empty(),
            )
            .unwrap();
            let fds: Vec<RawFd> = msg
                .cmsgs()
                .unwrap()
                .flat_map(|cmsg| match cmsg {
                    ControlMessageOwned::ScmRights(fds) => fds,
                    _ => Vec::new(),
                })
                .collect();
            (msg.bytes, fds)
        };

        let text = std::str::from_utf8(&buf[..len]).unwrap();
        let first_line = text.lines().next().unwrap();
        let command: CompositorCommand = serde_json::from_str(first_line).unwrap();
        assert_eq!(
            command,
            CompositorCommand::AttachInput {
                input: 3,
                addr: endpoint_addr
            }
        );
        assert_eq!(fds.len(), 1);

        // The pipeline reads whatever the relay forwards to the endpoint
        let passed = unsafe { UdpSocket::from_raw_fd(fds[0]) };
        assert_eq!(passed.local_addr().unwrap(), endpoint_addr);
        passed
            .set_read_timeout(Some(Duration::from_millis(500)))
            .unwrap();
        let sender = UdpSocket::bind("127.0.0.1:0").unwrap();
        sender.send_to(b"frame", endpoint_addr).unwrap();
        let mut frame = [0u8; 16];
        let (n, _) = passed.recv_from(&mut frame).unwrap();
        assert_eq!(&frame[..n], b"frame");
    }

    #[test]
    fn test_control_socket_sends_layout_lines() {
        let (relay_side, pipeline_side) = UnixStream::pair().unwrap();
        let mut control = ControlSocket::from_stream(relay_side);
        control.set_output_port(5004);
        control.set_alpha(EndpointIndex(1), 1.0);
        drop(control);

        let mut output = String::new();
        io::Read::read_to_string(&mut &pipeline_side, &mut output).unwrap();
        let commands: Vec<CompositorCommand> = output
            .lines()
            .map(|line| serde_json::from_str(line).unwrap())
            .collect();
        assert_eq!(
            commands,
            vec![
                CompositorCommand::SetOutputPort { port: 5004 },
                CompositorCommand::SetAlpha { input: 1, alpha: 1.0 },
            ]
        );
    }
}
