//! PTY descriptors, request payload codecs, and real PTY allocation.
//!
//! A session's PTY can be *emulated* (the descriptor is a plain data record
//! and writes get `\n` → `\r\n` normalization) or *allocated* (a kernel
//! master/slave pair backs the session and a child process can be attached
//! to the slave side). Allocation is Unix-only.

use crate::error::{Error, Result};

/// How the server backs an accepted `pty-req`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PtyMode {
    /// No kernel PTY; the session only gets newline normalization and
    /// window-change delivery.
    #[default]
    Emulated,
    /// Open a real master/slave pair so the handler can attach a child
    /// process. Unix only.
    Allocated,
}

/// Terminal window dimensions from `pty-req` and `window-change` requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Window {
    pub cols: u32,
    pub rows: u32,
    pub pixel_width: u32,
    pub pixel_height: u32,
}

impl Default for Window {
    fn default() -> Self {
        Window {
            cols: 80,
            rows: 24,
            pixel_width: 0,
            pixel_height: 0,
        }
    }
}

/// Encoded terminal modes from a `pty-req`, in wire order.
///
/// Opcodes 1..=159 carry a u32 argument; opcode 0 terminates the list and
/// opcodes 160..=255 (the OpenSSH extension space) also end parsing.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TerminalModes(pub Vec<(u8, u32)>);

pub const TTY_OP_END: u8 = 0;
pub const TTY_OP_ISPEED: u8 = 128;
pub const TTY_OP_OSPEED: u8 = 129;

impl TerminalModes {
    pub fn get(&self, opcode: u8) -> Option<u32> {
        self.0.iter().find(|(op, _)| *op == opcode).map(|(_, v)| *v)
    }

    /// Input/output baud rates, when the client sent them.
    pub fn baud(&self) -> (Option<u32>, Option<u32>) {
        (self.get(TTY_OP_ISPEED), self.get(TTY_OP_OSPEED))
    }

    /// Converts the transport library's pre-parsed mode pairs.
    pub fn from_transport(modes: &[(russh::Pty, u32)]) -> Self {
        TerminalModes(
            modes
                .iter()
                .filter(|(op, _)| (*op as u32) != 0)
                .map(|(op, v)| (*op as u8, *v))
                .collect(),
        )
    }
}

/// PTY descriptor attached to a session after an accepted `pty-req`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pty {
    /// Terminal type from the request (the `TERM` value, e.g. `xterm-256color`).
    pub term: String,
    pub window: Window,
    pub modes: TerminalModes,
}

// --- payload codecs (RFC 4254 §6.2 / §6.7) ---------------------------------

fn read_u32(buf: &[u8]) -> Option<(u32, &[u8])> {
    if buf.len() < 4 {
        return None;
    }
    let (head, rest) = buf.split_at(4);
    Some((u32::from_be_bytes(head.try_into().ok()?), rest))
}

fn read_string(buf: &[u8]) -> Option<(&[u8], &[u8])> {
    let (len, rest) = read_u32(buf)?;
    let len = len as usize;
    if rest.len() < len {
        return None;
    }
    Some(rest.split_at(len))
}

fn put_u32(out: &mut Vec<u8>, v: u32) {
    out.extend_from_slice(&v.to_be_bytes());
}

fn put_string(out: &mut Vec<u8>, s: &[u8]) {
    put_u32(out, s.len() as u32);
    out.extend_from_slice(s);
}

/// Parses a `pty-req` payload: term, window, encoded mode list.
pub fn parse_pty_request(payload: &[u8]) -> Result<Pty> {
    let (term, rest) = read_string(payload).ok_or(Error::Parse("pty-req"))?;
    let term = std::str::from_utf8(term)
        .map_err(|_| Error::Parse("pty-req"))?
        .to_string();
    let (cols, rest) = read_u32(rest).ok_or(Error::Parse("pty-req"))?;
    let (rows, rest) = read_u32(rest).ok_or(Error::Parse("pty-req"))?;
    let (pixel_width, rest) = read_u32(rest).ok_or(Error::Parse("pty-req"))?;
    let (pixel_height, rest) = read_u32(rest).ok_or(Error::Parse("pty-req"))?;
    if cols == 0 || rows == 0 {
        return Err(Error::Parse("pty-req"));
    }
    let (mode_list, _) = read_string(rest).ok_or(Error::Parse("pty-req"))?;
    Ok(Pty {
        term,
        window: Window {
            cols,
            rows,
            pixel_width,
            pixel_height,
        },
        modes: parse_terminal_modes(mode_list)?,
    })
}

pub fn marshal_pty_request(pty: &Pty) -> Vec<u8> {
    let mut out = Vec::with_capacity(pty.term.len() + 24 + pty.modes.0.len() * 5);
    put_string(&mut out, pty.term.as_bytes());
    put_u32(&mut out, pty.window.cols);
    put_u32(&mut out, pty.window.rows);
    put_u32(&mut out, pty.window.pixel_width);
    put_u32(&mut out, pty.window.pixel_height);
    let mut modes = Vec::with_capacity(pty.modes.0.len() * 5 + 1);
    for (op, v) in &pty.modes.0 {
        modes.push(*op);
        modes.extend_from_slice(&v.to_be_bytes());
    }
    modes.push(TTY_OP_END);
    put_string(&mut out, &modes);
    out
}

/// Parses the encoded terminal mode list from a `pty-req`.
pub fn parse_terminal_modes(mut buf: &[u8]) -> Result<TerminalModes> {
    let mut modes = Vec::new();
    while let Some((&opcode, rest)) = buf.split_first() {
        if opcode == TTY_OP_END || opcode >= 160 {
            break;
        }
        let (value, rest) = read_u32(rest).ok_or(Error::Parse("terminal modes"))?;
        modes.push((opcode, value));
        buf = rest;
    }
    Ok(TerminalModes(modes))
}

/// Parses a `window-change` payload.
pub fn parse_window_change(payload: &[u8]) -> Result<Window> {
    let (cols, rest) = read_u32(payload).ok_or(Error::Parse("window-change"))?;
    let (rows, rest) = read_u32(rest).ok_or(Error::Parse("window-change"))?;
    let (pixel_width, rest) = read_u32(rest).ok_or(Error::Parse("window-change"))?;
    let (pixel_height, _) = read_u32(rest).ok_or(Error::Parse("window-change"))?;
    if cols == 0 || rows == 0 {
        return Err(Error::Parse("window-change"));
    }
    Ok(Window {
        cols,
        rows,
        pixel_width,
        pixel_height,
    })
}

pub fn marshal_window_change(window: &Window) -> Vec<u8> {
    let mut out = Vec::with_capacity(16);
    put_u32(&mut out, window.cols);
    put_u32(&mut out, window.rows);
    put_u32(&mut out, window.pixel_width);
    put_u32(&mut out, window.pixel_height);
    out
}

/// Marshals an `exit-status` payload: a single big-endian u32.
pub fn marshal_exit_status(code: u32) -> Vec<u8> {
    code.to_be_bytes().to_vec()
}

// --- newline normalization -------------------------------------------------

/// Normalizes handler output for a PTY session: every `\n` becomes `\r\n`,
/// and pre-existing `\r\n` (or a stray `\r\r\n`) collapses back to `\r\n`.
pub fn normalize_newlines(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len() + data.len() / 8);
    for &b in data {
        if b == b'\n' && out.last() != Some(&b'\r') {
            out.push(b'\r');
        }
        if b == b'\n' {
            // collapse \r\r\n
            while out.len() >= 2 && out[out.len() - 1] == b'\r' && out[out.len() - 2] == b'\r' {
                out.pop();
            }
        }
        out.push(b);
    }
    out
}

// --- real PTY allocation (Unix) --------------------------------------------

#[cfg(unix)]
pub use unix::PtyAllocation;

#[cfg(unix)]
mod unix {
    use std::fs::File;
    use std::os::unix::io::{AsRawFd, FromRawFd};

    use nix::unistd::{dup2, setsid};
    use tracing::trace;

    use super::{TerminalModes, Window, TTY_OP_ISPEED, TTY_OP_OSPEED};
    use crate::error::{Error, Result};

    /// A kernel PTY pair backing a session.
    ///
    /// The master side stays with the framework (bridged to the SSH
    /// channel); `start` hands the slave side to a child process as its
    /// controlling terminal.
    pub struct PtyAllocation {
        master: File,
        slave: Option<File>,
    }

    impl PtyAllocation {
        /// Opens a master/slave pair sized to `window` and applies the
        /// client's terminal modes.
        pub fn open(window: Window, modes: &TerminalModes) -> Result<Self> {
            let winsize = nix::libc::winsize {
                ws_row: window.rows as u16,
                ws_col: window.cols as u16,
                ws_xpixel: window.pixel_width as u16,
                ws_ypixel: window.pixel_height as u16,
            };
            let pty = openpty::openpty(None, Some(&winsize), None)
                .map_err(|e| Error::Io(std::io::Error::other(format!("openpty: {:?}", e))))?;
            let alloc = PtyAllocation {
                master: pty.0,
                slave: Some(pty.1),
            };
            alloc.apply_modes(modes);
            Ok(alloc)
        }

        /// Applies the subset of RFC 4254 terminal modes the platform
        /// supports: baud rates, control characters, and the common
        /// input/output/local flags. Unknown opcodes are ignored.
        fn apply_modes(&self, modes: &TerminalModes) {
            use nix::sys::termios::{self, SetArg, SpecialCharacterIndices as Cc};

            let fd = self.master.as_raw_fd();
            let borrowed = unsafe { std::os::unix::io::BorrowedFd::borrow_raw(fd) };
            let Ok(mut tios) = termios::tcgetattr(borrowed) else {
                return;
            };

            for &(opcode, value) in &modes.0 {
                match opcode {
                    TTY_OP_ISPEED | TTY_OP_OSPEED => {
                        if let Some(baud) = baud_rate(value) {
                            let _ = if opcode == TTY_OP_ISPEED {
                                termios::cfsetispeed(&mut tios, baud)
                            } else {
                                termios::cfsetospeed(&mut tios, baud)
                            };
                        }
                    }
                    _ => {
                        if let Some(cc) = control_char(opcode) {
                            tios.control_chars[cc as usize] = value as u8;
                        } else {
                            apply_flag(&mut tios, opcode, value != 0);
                        }
                    }
                }
            }
            let _ = termios::tcsetattr(borrowed, SetArg::TCSANOW, &tios);

            fn control_char(opcode: u8) -> Option<Cc> {
                Some(match opcode {
                    1 => Cc::VINTR,
                    2 => Cc::VQUIT,
                    3 => Cc::VERASE,
                    4 => Cc::VKILL,
                    5 => Cc::VEOF,
                    6 => Cc::VEOL,
                    7 => Cc::VEOL2,
                    8 => Cc::VSTART,
                    9 => Cc::VSTOP,
                    10 => Cc::VSUSP,
                    12 => Cc::VREPRINT,
                    13 => Cc::VWERASE,
                    14 => Cc::VLNEXT,
                    18 => Cc::VDISCARD,
                    _ => return None,
                })
            }

            fn apply_flag(tios: &mut termios::Termios, opcode: u8, on: bool) {
                use nix::sys::termios::{ControlFlags, InputFlags, LocalFlags, OutputFlags};
                macro_rules! flag {
                    ($set:expr, $flag:expr) => {{
                        $set.set($flag, on);
                    }};
                }
                match opcode {
                    30 => flag!(tios.input_flags, InputFlags::IGNPAR),
                    31 => flag!(tios.input_flags, InputFlags::PARMRK),
                    32 => flag!(tios.input_flags, InputFlags::INPCK),
                    33 => flag!(tios.input_flags, InputFlags::ISTRIP),
                    34 => flag!(tios.input_flags, InputFlags::INLCR),
                    35 => flag!(tios.input_flags, InputFlags::IGNCR),
                    36 => flag!(tios.input_flags, InputFlags::ICRNL),
                    38 => flag!(tios.input_flags, InputFlags::IXON),
                    39 => flag!(tios.input_flags, InputFlags::IXANY),
                    40 => flag!(tios.input_flags, InputFlags::IXOFF),
                    41 => flag!(tios.input_flags, InputFlags::IMAXBEL),
                    42 => flag!(tios.input_flags, InputFlags::IUTF8),
                    50 => flag!(tios.local_flags, LocalFlags::ISIG),
                    51 => flag!(tios.local_flags, LocalFlags::ICANON),
                    53 => flag!(tios.local_flags, LocalFlags::ECHO),
                    54 => flag!(tios.local_flags, LocalFlags::ECHOE),
                    55 => flag!(tios.local_flags, LocalFlags::ECHOK),
                    56 => flag!(tios.local_flags, LocalFlags::ECHONL),
                    57 => flag!(tios.local_flags, LocalFlags::NOFLSH),
                    58 => flag!(tios.local_flags, LocalFlags::TOSTOP),
                    59 => flag!(tios.local_flags, LocalFlags::IEXTEN),
                    60 => flag!(tios.local_flags, LocalFlags::ECHOCTL),
                    61 => flag!(tios.local_flags, LocalFlags::ECHOKE),
                    62 => flag!(tios.local_flags, LocalFlags::PENDIN),
                    70 => flag!(tios.output_flags, OutputFlags::OPOST),
                    72 => flag!(tios.output_flags, OutputFlags::ONLCR),
                    73 => flag!(tios.output_flags, OutputFlags::OCRNL),
                    74 => flag!(tios.output_flags, OutputFlags::ONOCR),
                    75 => flag!(tios.output_flags, OutputFlags::ONLRET),
                    90 => flag!(tios.control_flags, ControlFlags::CS7),
                    91 => flag!(tios.control_flags, ControlFlags::CS8),
                    92 => flag!(tios.control_flags, ControlFlags::PARENB),
                    93 => flag!(tios.control_flags, ControlFlags::PARODD),
                    _ => {}
                }
            }

            fn baud_rate(value: u32) -> Option<nix::sys::termios::BaudRate> {
                use nix::sys::termios::BaudRate::*;
                Some(match value {
                    300 => B300,
                    1200 => B1200,
                    2400 => B2400,
                    4800 => B4800,
                    9600 => B9600,
                    19200 => B19200,
                    38400 => B38400,
                    57600 => B57600,
                    115200 => B115200,
                    230400 => B230400,
                    _ => return None,
                })
            }
        }

        /// Updates the kernel window size after a `window-change`.
        pub fn resize(&self, window: Window) {
            let mut winsize = nix::libc::winsize {
                ws_row: window.rows as u16,
                ws_col: window.cols as u16,
                ws_xpixel: window.pixel_width as u16,
                ws_ypixel: window.pixel_height as u16,
            };
            unsafe {
                nix::libc::ioctl(
                    self.master.as_raw_fd(),
                    nix::libc::TIOCSWINSZ,
                    &mut winsize,
                );
            }
        }

        /// Spawns `cmd` attached to the slave side as session leader with
        /// the PTY as its controlling terminal. The slave handle is consumed;
        /// call at most once.
        pub fn start(&mut self, cmd: &mut tokio::process::Command) -> Result<tokio::process::Child> {
            let slave = self
                .slave
                .take()
                .ok_or_else(|| Error::Configuration("pty already started".into()))?;
            let slave_fd = slave.as_raw_fd();
            cmd.stdin(slave.try_clone()?);
            cmd.stdout(slave.try_clone()?);
            cmd.stderr(slave.try_clone()?);
            unsafe {
                cmd.pre_exec(move || {
                    setsid().map_err(std::io::Error::other)?;
                    if nix::libc::ioctl(slave_fd, nix::libc::TIOCSCTTY, 0) < 0 {
                        return Err(std::io::Error::last_os_error());
                    }
                    dup2(slave_fd, 0).map_err(std::io::Error::other)?;
                    dup2(slave_fd, 1).map_err(std::io::Error::other)?;
                    dup2(slave_fd, 2).map_err(std::io::Error::other)?;
                    Ok(())
                });
            }
            let child = cmd.spawn()?;
            drop(slave);
            trace!(master_fd = self.master.as_raw_fd(), "pty child spawned");
            Ok(child)
        }

        /// Independent read and write handles on the master side.
        ///
        /// PTYs are character devices; splitting one `File` does not give
        /// working bidirectional I/O, so the fd is duplicated twice.
        pub fn split_master(&self) -> Result<(tokio::fs::File, tokio::fs::File)> {
            let read_fd = unsafe { nix::libc::dup(self.master.as_raw_fd()) };
            if read_fd < 0 {
                return Err(Error::Io(std::io::Error::last_os_error()));
            }
            let write_fd = unsafe { nix::libc::dup(self.master.as_raw_fd()) };
            if write_fd < 0 {
                unsafe { nix::libc::close(read_fd) };
                return Err(Error::Io(std::io::Error::last_os_error()));
            }
            let reader = unsafe { File::from_raw_fd(read_fd) };
            let writer = unsafe { File::from_raw_fd(write_fd) };
            Ok((
                tokio::fs::File::from_std(reader),
                tokio::fs::File::from_std(writer),
            ))
        }
    }
}

#[cfg(not(unix))]
pub struct PtyAllocation;

#[cfg(not(unix))]
impl PtyAllocation {
    pub fn open(_window: Window, _modes: &TerminalModes) -> Result<Self> {
        Err(Error::Unsupported)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_pty() -> Pty {
        Pty {
            term: "xterm-256color".into(),
            window: Window {
                cols: 120,
                rows: 40,
                pixel_width: 960,
                pixel_height: 640,
            },
            modes: TerminalModes(vec![(1, 3), (53, 1), (TTY_OP_ISPEED, 115200), (TTY_OP_OSPEED, 115200)]),
        }
    }

    #[test]
    fn pty_request_round_trips() {
        let pty = sample_pty();
        let parsed = parse_pty_request(&marshal_pty_request(&pty)).unwrap();
        assert_eq!(parsed, pty);
    }

    #[test]
    fn window_change_round_trips() {
        let win = Window {
            cols: 132,
            rows: 50,
            pixel_width: 0,
            pixel_height: 0,
        };
        assert_eq!(parse_window_change(&marshal_window_change(&win)).unwrap(), win);
    }

    #[test]
    fn zero_dimensions_are_refused() {
        let mut pty = sample_pty();
        pty.window.cols = 0;
        assert!(parse_pty_request(&marshal_pty_request(&pty)).is_err());
        assert!(parse_window_change(&[0; 16]).is_err());
    }

    #[test]
    fn truncated_payloads_are_refused() {
        let buf = marshal_pty_request(&sample_pty());
        assert!(parse_pty_request(&buf[..buf.len() - 3]).is_err());
        assert!(parse_pty_request(&buf[..2]).is_err());
    }

    #[test]
    fn extension_opcodes_terminate_mode_parsing() {
        // opcode 200 is in the OpenSSH extension space and ends the list.
        let raw = [1u8, 0, 0, 0, 3, 200, 9, 9, 9, 9, 1, 0, 0, 0, 4];
        let modes = parse_terminal_modes(&raw).unwrap();
        assert_eq!(modes.0, vec![(1, 3)]);
    }

    #[test]
    fn mode_list_without_argument_is_an_error() {
        assert!(parse_terminal_modes(&[1u8, 0, 0]).is_err());
    }

    #[test]
    fn newline_normalization() {
        assert_eq!(normalize_newlines(b"hi\n"), b"hi\r\n");
        assert_eq!(normalize_newlines(b"a\nb\n"), b"a\r\nb\r\n");
        // already-normalized output is left alone
        assert_eq!(normalize_newlines(b"hi\r\n"), b"hi\r\n");
        // and \r\r\n collapses
        assert_eq!(normalize_newlines(b"hi\r\r\n"), b"hi\r\n");
        assert_eq!(normalize_newlines(b"no newline"), b"no newline");
    }

    #[test]
    fn exit_status_is_big_endian_u32() {
        assert_eq!(marshal_exit_status(0), vec![0, 0, 0, 0]);
        assert_eq!(marshal_exit_status(130), vec![0, 0, 0, 130]);
    }
}
