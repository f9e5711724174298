use std::io::{self, Write};

use zstd::zstd_safe::{zstd_sys::ZSTD_EndDirective, CCtx, CParameter, InBuffer, OutBuffer};

/// Compression level used by the `zstd` CLI by default (and by GNU tar's
/// `--zstd` flag).
const ZSTD_CLI_LEVEL: i32 = 3;

/// Streaming zstd compressor producing output byte-identical to
/// `zstd -3` reading from a pipe.
///
/// Matching the CLI bitstream takes four pinned parameters plus two
/// protocol details:
///
/// - level 3, content checksum on, content-size field off (a pipe reader
///   cannot know the total size up front),
/// - multi-threaded mode with exactly one worker: reading from a pipe the
///   CLI takes the multi-threaded code path even for `-T1`, and that path
///   emits a different bitstream than the single-threaded one,
/// - an empty `continue` call before any payload, locking the window to
///   the level default instead of letting the encoder shrink it to fit a
///   small single-shot input,
/// - the staged tail is flushed with `end` directly rather than a
///   `continue` followed by an empty `end`.
pub(crate) struct ZstdWriter<W: Write> {
    w: W,
    cctx: CCtx<'static>,
    in_buf: Vec<u8>,
    in_pos: usize,
    out_buf: Vec<u8>,
    initialized: bool,
}

fn map_zstd_error(code: usize) -> io::Error {
    io::Error::other(format!(
        "zstd compress: {}",
        zstd::zstd_safe::get_error_name(code)
    ))
}

impl<W: Write> ZstdWriter<W> {
    pub(crate) fn new(w: W) -> io::Result<Self> {
        let mut cctx =
            CCtx::try_create().ok_or_else(|| io::Error::other("failed to create zstd context"))?;
        cctx.set_parameter(CParameter::CompressionLevel(ZSTD_CLI_LEVEL))
            .map_err(map_zstd_error)?;
        cctx.set_parameter(CParameter::ChecksumFlag(true))
            .map_err(map_zstd_error)?;
        cctx.set_parameter(CParameter::ContentSizeFlag(false))
            .map_err(map_zstd_error)?;
        cctx.set_parameter(CParameter::NbWorkers(1))
            .map_err(map_zstd_error)?;

        Ok(Self {
            w,
            cctx,
            in_buf: vec![0u8; CCtx::in_size()],
            in_pos: 0,
            out_buf: vec![0u8; CCtx::out_size()],
            initialized: false,
        })
    }

    /// Flush the staged tail with the `end` directive and hand back the
    /// underlying writer. The compression context is released on drop.
    pub(crate) fn finish(mut self) -> io::Result<W> {
        self.init_stream()?;
        self.flush_staged(true)?;
        Ok(self.w)
    }

    fn init_stream(&mut self) -> io::Result<()> {
        if self.initialized {
            return Ok(());
        }
        self.initialized = true;
        let mut input = InBuffer::around(&[]);
        self.compress_chunk(&mut input, ZSTD_EndDirective::ZSTD_e_continue)?;
        Ok(())
    }

    /// One `ZSTD_compressStream2` step; drains whatever output the encoder
    /// produced into the inner writer. Returns the encoder's remaining
    /// byte hint.
    fn compress_chunk(
        &mut self,
        input: &mut InBuffer<'_>,
        directive: ZSTD_EndDirective,
    ) -> io::Result<usize> {
        let (remaining, produced) = {
            let mut output = OutBuffer::around(self.out_buf.as_mut_slice());
            let remaining = self
                .cctx
                .compress_stream2(&mut output, input, directive)
                .map_err(map_zstd_error)?;
            (remaining, output.pos())
        };
        if produced > 0 {
            self.w.write_all(&self.out_buf[..produced])?;
        }
        Ok(remaining)
    }

    fn flush_staged(&mut self, end: bool) -> io::Result<()> {
        if self.in_pos == 0 && !end {
            return Ok(());
        }
        let directive = if end {
            ZSTD_EndDirective::ZSTD_e_end
        } else {
            ZSTD_EndDirective::ZSTD_e_continue
        };

        let staged = std::mem::take(&mut self.in_buf);
        let mut input = InBuffer::around(&staged[..self.in_pos]);
        let result = loop {
            match self.compress_chunk(&mut input, directive) {
                Err(err) => break Err(err),
                Ok(remaining) => {
                    let done = if end {
                        remaining == 0
                    } else {
                        input.pos >= input.src.len()
                    };
                    if done {
                        break Ok(());
                    }
                }
            }
        };
        self.in_buf = staged;
        self.in_pos = 0;
        result
    }
}

impl<W: Write> Write for ZstdWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.init_stream()?;
        let total = buf.len();
        let mut rest = buf;
        while !rest.is_empty() {
            let space = self.in_buf.len() - self.in_pos;
            let n = space.min(rest.len());
            self.in_buf[self.in_pos..self.in_pos + n].copy_from_slice(&rest[..n]);
            self.in_pos += n;
            rest = &rest[n..];
            if self.in_pos == self.in_buf.len() {
                self.flush_staged(false)?;
            }
        }
        Ok(total)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.w.flush()
    }
}
