use std::io::{self, Read, Write};

const TAR_BLOCK_SIZE: usize = 512;
const TAR_NAME_SIZE: usize = 100;
// Blocking factor 20, i.e. GNU tar's default record size.
const TAR_RECORD_SIZE: u64 = 10240;
const TAR_END_OF_ARCHIVE_BLOCKS: usize = 2;
const TAR_PAX_LEN_FALLBACK_WIDTH: usize = 11;
const TAR_PAX_HDR_MODE: u32 = 0o644;

const TAR_TYPE_PAX: u8 = b'x';
pub(crate) const TAR_TYPE_FILE: u8 = b'0';
pub(crate) const TAR_TYPE_DIR: u8 = b'5';
pub(crate) const TAR_TYPE_SYMLINK: u8 = b'2';

/// Metadata for one archive entry.
pub(crate) struct TarEntryInfo<'a> {
    pub mode: u32,
    pub size: u64,
    pub mtime: u64,
    pub typeflag: u8,
    pub linkname: String,
    pub data: Option<&'a mut (dyn Read + Send)>,
}

/// Tar writer matching GNU tar's PAX-format output byte for byte:
///
/// ```text
/// tar --sort=name --mtime="@315532800" --owner=0 --group=0 --numeric-owner \
///   --pax-option=exthdr.name=%d/PaxHeaders/%f,delete=atime,delete=ctime -cf -
/// ```
///
/// Callers feed entries already sorted by path; this type only reproduces
/// the header encoding, PAX records, padding, and end-of-archive framing.
pub(crate) struct GnuTarWriter<W: Write> {
    w: W,
    written: u64,
}

struct TarHeader<'a> {
    name: &'a [u8],
    mode: u32,
    size: u64,
    mtime: u64,
    typeflag: u8,
    linkname: &'a [u8],
}

impl<W: Write> GnuTarWriter<W> {
    pub(crate) fn new(w: W) -> Self {
        Self { w, written: 0 }
    }

    pub(crate) fn into_inner(self) -> W {
        self.w
    }

    /// Write one entry, prefixing a PAX extended header when the path or
    /// link target exceeds the 100-byte USTAR fields.
    pub(crate) fn write_entry(
        &mut self,
        tar_path: &str,
        info: TarEntryInfo<'_>,
    ) -> io::Result<()> {
        if tar_path.len() <= TAR_NAME_SIZE && info.linkname.len() <= TAR_NAME_SIZE {
            self.write_ustar_entry(tar_path.as_bytes(), info)
        } else {
            self.write_pax_entry(tar_path, info)
        }
    }

    /// Write the end-of-archive marker (two zero blocks) and pad the
    /// archive out to the blocking-factor boundary.
    pub(crate) fn close(&mut self) -> io::Result<()> {
        let zeros = [0u8; TAR_BLOCK_SIZE * TAR_END_OF_ARCHIVE_BLOCKS];
        self.write_bytes(&zeros)?;

        let remainder = self.written % TAR_RECORD_SIZE;
        if remainder != 0 {
            let padding = vec![0u8; (TAR_RECORD_SIZE - remainder) as usize];
            self.write_bytes(&padding)?;
        }
        Ok(())
    }

    fn write_ustar_entry(&mut self, name: &[u8], info: TarEntryInfo<'_>) -> io::Result<()> {
        self.write_header_block(&TarHeader {
            name,
            mode: info.mode,
            size: info.size,
            mtime: info.mtime,
            typeflag: info.typeflag,
            linkname: info.linkname.as_bytes(),
        })?;
        self.write_file_data(info)
    }

    fn write_pax_entry(&mut self, tar_path: &str, info: TarEntryInfo<'_>) -> io::Result<()> {
        let pax_data = build_pax_records(tar_path, &info.linkname);
        let pax_name = build_pax_header_name(tar_path);

        self.write_header_block(&TarHeader {
            name: &pax_name,
            mode: TAR_PAX_HDR_MODE,
            size: pax_data.len() as u64,
            mtime: info.mtime,
            typeflag: TAR_TYPE_PAX,
            linkname: b"",
        })?;
        self.write_bytes(pax_data.as_bytes())?;
        self.write_zero_padding(pax_data.len())?;

        let name = truncate_to_name_size(tar_path.as_bytes());
        let linkname = truncate_to_name_size(info.linkname.as_bytes());
        self.write_header_block(&TarHeader {
            name,
            mode: info.mode,
            size: info.size,
            mtime: info.mtime,
            typeflag: info.typeflag,
            linkname,
        })?;
        self.write_file_data(info)
    }

    fn write_file_data(&mut self, info: TarEntryInfo<'_>) -> io::Result<()> {
        if info.typeflag != TAR_TYPE_FILE || info.size == 0 {
            return Ok(());
        }
        let Some(reader) = info.data else {
            return Ok(());
        };

        let mut copied: u64 = 0;
        let mut buf = vec![0u8; 64 * 1024];
        loop {
            let n = reader.read(&mut buf)?;
            if n == 0 {
                break;
            }
            self.write_bytes(&buf[..n])?;
            copied += n as u64;
        }
        if copied != info.size {
            return Err(io::Error::other(format!(
                "entry length changed while archiving (declared {}, read {copied})",
                info.size
            )));
        }
        self.write_zero_padding(copied as usize)
    }

    /// Emit one 512-byte USTAR header block.
    ///
    /// devmajor/devminor (offsets 329..345) stay NUL-filled: GNU tar
    /// writes all-NUL for non-device files, not octal zero.
    fn write_header_block(&mut self, h: &TarHeader<'_>) -> io::Result<()> {
        let mut block = [0u8; TAR_BLOCK_SIZE];

        copy_field(&mut block[0..100], h.name);
        format_octal(&mut block[100..108], u64::from(h.mode));
        format_octal(&mut block[108..116], 0); // uid
        format_octal(&mut block[116..124], 0); // gid
        format_octal(&mut block[124..136], h.size);
        format_octal(&mut block[136..148], h.mtime);
        block[148..156].fill(b' '); // chksum placeholder
        block[156] = h.typeflag;
        copy_field(&mut block[157..257], h.linkname);
        block[257..263].copy_from_slice(b"ustar\0");
        block[263..265].copy_from_slice(b"00");
        // uname/gname (265..329) stay empty; prefix (345..500) is unused
        // because long paths go through the PAX path record instead.

        let checksum: u64 = block.iter().map(|byte| u64::from(*byte)).sum();
        let rendered = format!("{checksum:06o}\0 ");
        block[148..156].copy_from_slice(&rendered.as_bytes()[..8]);

        self.write_bytes(&block)
    }

    fn write_zero_padding(&mut self, data_size: usize) -> io::Result<()> {
        let remainder = data_size % TAR_BLOCK_SIZE;
        if remainder == 0 {
            return Ok(());
        }
        let padding = vec![0u8; TAR_BLOCK_SIZE - remainder];
        self.write_bytes(&padding)
    }

    fn write_bytes(&mut self, data: &[u8]) -> io::Result<()> {
        self.w.write_all(data)?;
        self.written += data.len() as u64;
        Ok(())
    }
}

fn copy_field(dst: &mut [u8], src: &[u8]) {
    let len = src.len().min(dst.len());
    dst[..len].copy_from_slice(&src[..len]);
}

/// Zero-padded, NUL-terminated octal rendering, GNU-style.
fn format_octal(dst: &mut [u8], value: u64) {
    let width = dst.len() - 1;
    let rendered = format!("{value:0width$o}");
    let bytes = rendered.as_bytes();
    let bytes = if bytes.len() > width {
        &bytes[bytes.len() - width..]
    } else {
        bytes
    };
    dst[..bytes.len()].copy_from_slice(bytes);
    dst[dst.len() - 1] = 0;
}

/// PAX extended header payload. Only `path` and (when oversized)
/// `linkpath` records are emitted; atime/ctime are deleted per the
/// `--pax-option` this writer mirrors.
fn build_pax_records(tar_path: &str, linkname: &str) -> String {
    let mut records = format_pax_record("path", tar_path);
    if linkname.len() > TAR_NAME_SIZE {
        records.push_str(&format_pax_record("linkpath", linkname));
    }
    records
}

/// One PAX record: `"<len> <key>=<value>\n"` where `<len>` counts the whole
/// record including itself. The width of the length field feeds back into
/// the length, so search for the self-consistent width.
fn format_pax_record(key: &str, value: &str) -> String {
    let content = format!("{key}={value}\n");

    for width in 1..=10 {
        let total = width + 1 + content.len();
        if total.to_string().len() == width {
            return format!("{total} {content}");
        }
    }

    let total = TAR_PAX_LEN_FALLBACK_WIDTH + 1 + content.len();
    format!("{total} {content}")
}

/// Extended-header name per `--pax-option=exthdr.name=%d/PaxHeaders/%f`,
/// truncated to the USTAR name field.
fn build_pax_header_name(tar_path: &str) -> Vec<u8> {
    let trimmed = tar_path.trim_end_matches('/');
    let (dir, base) = match trimmed.rfind('/') {
        Some(idx) => (&trimmed[..idx], &trimmed[idx + 1..]),
        None => (".", trimmed),
    };
    let name = format!("{dir}/PaxHeaders/{base}");
    truncate_to_name_size(name.as_bytes()).to_vec()
}

fn truncate_to_name_size(name: &[u8]) -> &[u8] {
    if name.len() > TAR_NAME_SIZE {
        &name[..TAR_NAME_SIZE]
    } else {
        name
    }
}
