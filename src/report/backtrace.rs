//! Bounded stack capture for assertion reports.
use std::fmt;

/// The maximum number of stack frames captured for an assertion report.
pub const MAX_FRAMES: usize = 128;

/// One captured frame. `symbol` holds the resolved name and the offset of the instruction
/// pointer from the symbol's start, when resolution succeeded.
#[derive(Debug, Clone)]
pub struct Frame {
    pub ip: usize,
    pub symbol: Option<(String, usize)>,
}

/// Capture up to [`MAX_FRAMES`] frames of the current stack and resolve them best-effort.
#[must_use]
pub fn capture() -> Vec<Frame> {
    let mut raw = Vec::with_capacity(MAX_FRAMES);
    backtrace::trace(|frame| {
        raw.push(frame.clone());
        raw.len() < MAX_FRAMES
    });

    raw.iter()
        .map(|frame| {
            let ip = frame.ip() as usize;
            let mut symbol = None;
            backtrace::resolve_frame(frame, |sym| {
                if symbol.is_some() {
                    return;
                }
                if let Some(name) = sym.name() {
                    let start = sym.addr().map_or(ip, |addr| addr as usize);
                    symbol = Some((name.to_string(), ip.saturating_sub(start)));
                }
            });
            Frame { ip, symbol }
        })
        .collect()
}

/// Formats a frame as `#N 0xADDR in name()+0xOFF`, or `#N 0xADDR in ??` when unresolved.
pub struct Numbered<'a>(pub usize, pub &'a Frame);

impl fmt::Display for Numbered<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let Numbered(i, frame) = self;
        match &frame.symbol {
            Some((name, offset)) => write!(f, "#{i} {:#x} in {name}()+{offset:#x}", frame.ip),
            None => write!(f, "#{i} {:#x} in ??", frame.ip),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capture_is_bounded() {
        fn recurse(n: usize) -> Vec<Frame> {
            if n == 0 {
                capture()
            } else {
                let frames = recurse(n - 1);
                std::hint::black_box(frames)
            }
        }
        let frames = recurse(MAX_FRAMES + 20);
        assert!(!frames.is_empty());
        assert!(frames.len() <= MAX_FRAMES);
    }

    #[test]
    fn unresolved_frames_show_raw_address() {
        let frame = Frame {
            ip: 0xdead,
            symbol: None,
        };
        assert_eq!(Numbered(3, &frame).to_string(), "#3 0xdead in ??");

        let frame = Frame {
            ip: 0x1010,
            symbol: Some(("named::main".to_string(), 0x10)),
        };
        assert_eq!(
            Numbered(0, &frame).to_string(),
            "#0 0x1010 in named::main()+0x10"
        );
    }
}
