//! Broadcast printer: formats one message and fans it out to every
//! registered transport, mirroring the %-format broadcast helper the
//! command parser uses to build its `<...>` responses.
//!
//! Transports themselves (serial UARTs, USB CDC, ...) are out of scope
//! here; this module only owns the fixed-capacity registration table and
//! the formatter.

use core::fmt::Write as _;
use heapless::String;

use crate::error::Error;

/// How many transports can be registered at once.
pub const MAX_INTERFACES: usize = 5;
/// Longest formatted message the printer will build.
pub const BUFFER_CAP: usize = 256;

/// One registered output. Infallible: a send that can't be accepted by the
/// underlying link is the transport's problem to buffer or drop, not ours.
pub trait Transport {
    fn send(&mut self, message: &str);
}

/// A formatting argument. Covers the `%d %s %x %o %b %f` conversions the
/// command grammar's responses need.
pub enum Arg<'a> {
    Int(i32),
    Str(&'a str),
    Float(f32),
}

pub struct Printer<'a> {
    interfaces: [Option<&'a mut dyn Transport>; MAX_INTERFACES],
    count: usize,
}

impl<'a> Printer<'a> {
    pub fn new() -> Self {
        Self {
            interfaces: [None, None, None, None, None],
            count: 0,
        }
    }

    /// Registers `transport`. Silently drops the registration once
    /// `MAX_INTERFACES` is reached, matching the original's fixed-size
    /// interface table.
    pub fn register(&mut self, transport: &'a mut dyn Transport) {
        if self.count < MAX_INTERFACES {
            self.interfaces[self.count] = Some(transport);
            self.count += 1;
        }
    }

    /// Formats `fmt` against `args` and sends the result to every
    /// registered transport. `fmt` uses `%d %s %x %o %b %f %%` as its only
    /// conversions; anything else passes through literally.
    pub fn broadcast(&mut self, fmt: &str, args: &[Arg]) -> Result<(), Error> {
        let message = format_message(fmt, args)?;
        for slot in self.interfaces.iter_mut().take(self.count) {
            if let Some(transport) = slot {
                transport.send(&message);
            }
        }
        Ok(())
    }
}

impl<'a> Default for Printer<'a> {
    fn default() -> Self {
        Self::new()
    }
}

fn format_message(fmt: &str, args: &[Arg]) -> Result<String<BUFFER_CAP>, Error> {
    let mut buf = String::new();
    let mut args = args.iter();
    let mut chars = fmt.chars();

    while let Some(c) = chars.next() {
        if c != '%' {
            buf.push(c).map_err(|_| Error::TransportFull)?;
            continue;
        }

        let conversion = chars.next().ok_or(Error::MalformedCommand)?;
        let result = match conversion {
            '%' => buf.push('%').map_err(|_| ()),
            'd' => write!(buf, "{}", next_int(&mut args)?).map_err(|_| ()),
            'x' => write!(buf, "{:x}", next_int(&mut args)?).map_err(|_| ()),
            'o' => write!(buf, "{:o}", next_int(&mut args)?).map_err(|_| ()),
            'b' => write!(buf, "{:b}", next_int(&mut args)?).map_err(|_| ()),
            'f' => write!(buf, "{:.2}", next_float(&mut args)?).map_err(|_| ()),
            's' => buf.push_str(next_str(&mut args)?).map_err(|_| ()),
            _ => return Err(Error::MalformedCommand),
        };
        result.map_err(|_| Error::TransportFull)?;
    }

    Ok(buf)
}

fn next_int(args: &mut core::slice::Iter<'_, Arg<'_>>) -> Result<i32, Error> {
    match args.next() {
        Some(Arg::Int(v)) => Ok(*v),
        _ => Err(Error::MalformedCommand),
    }
}

fn next_float(args: &mut core::slice::Iter<'_, Arg<'_>>) -> Result<f32, Error> {
    match args.next() {
        Some(Arg::Float(v)) => Ok(*v),
        _ => Err(Error::MalformedCommand),
    }
}

fn next_str<'b>(args: &mut core::slice::Iter<'b, Arg<'_>>) -> Result<&'b str, Error> {
    match args.next() {
        Some(Arg::Str(v)) => Ok(v),
        _ => Err(Error::MalformedCommand),
    }
}
