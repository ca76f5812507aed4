//! Action payload extraction and optional compilation.
//!
//! Each init lays its payload out under the next numbered directory of the
//! proxy's base dir:
//!
//! ```text
//! <base>/<n>/src        extracted payload
//! <base>/<n>/bin/exec   the runnable the executor spawns
//! ```
//!
//! Recognized payloads: a gzip'd tarball (unpacked into `src/`), a single
//! native executable (ELF or `#!` script, written as `src/exec`), or a
//! single source file. Without a compiler helper, `src` is renamed to `bin`
//! as-is; otherwise the helper is invoked as `<compiler> <main> <src> <bin>`
//! and must produce `bin/exec`.

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::process::Command;

use flate2::read::GzDecoder;

use crate::error::{Error, Result};

/// Name of the runnable inside `bin/`.
const EXEC_NAME: &str = "exec";

/// Returns the highest numbered subdirectory of `base`, or 0 if none.
pub(crate) fn highest_dir(base: &Path) -> usize {
    let Ok(entries) = fs::read_dir(base) else {
        return 0;
    };
    entries
        .filter_map(|e| e.ok())
        .filter_map(|e| e.file_name().to_str().and_then(|n| n.parse().ok()))
        .max()
        .unwrap_or(0)
}

/// Extracts `payload` under the next numbered directory of `base` and
/// produces `bin/exec`. Returns the allocated number and the runnable path.
///
/// Compile failures map to 502; the returned path exists and is the file
/// the executor should spawn (executability is the child's problem, as the
/// spawn will report it).
pub(crate) fn extract_and_compile(
    base: &Path,
    payload: &[u8],
    main: &str,
    compiler: Option<&Path>,
) -> Result<(usize, PathBuf)> {
    fs::create_dir_all(base)?;

    // Allocate the directory number through the filesystem: the first
    // create_dir wins, so concurrent inits cannot share a directory.
    let mut n = highest_dir(base) + 1;
    let parent = loop {
        let candidate = base.join(n.to_string());
        match fs::create_dir(&candidate) {
            Ok(()) => break candidate,
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => n += 1,
            Err(e) => return Err(e.into()),
        }
    };
    let src = parent.join("src");
    let bin = parent.join("bin");
    fs::create_dir_all(&src)?;

    if is_gzip(payload) {
        unpack_tar_gz(payload, &src)?;
    } else {
        write_exec_file(&src.join(EXEC_NAME), payload)?;
    }

    let bin_file = bin.join(EXEC_NAME);
    let src_exec = src.join(EXEC_NAME);

    match compiler {
        Some(compiler) if !is_native(&src_exec) => {
            fs::create_dir_all(&bin)?;
            compile_action(compiler, main, &src, &bin)?;
            if !bin_file.exists() {
                return Err(Error::BadGateway("cannot compile".to_owned()));
            }
        }
        // Already runnable, or nothing to compile with: promote wholesale.
        _ => fs::rename(&src, &bin)?,
    }
    Ok((n, bin_file))
}

/// Runs the compiler helper: `<compiler> <main> <src> <bin>`.
fn compile_action(compiler: &Path, main: &str, src: &Path, bin: &Path) -> Result<()> {
    tracing::debug!("compiling with {}: main={main}", compiler.display());
    let output = Command::new(compiler)
        .arg(main)
        .arg(src)
        .arg(bin)
        .output()
        .map_err(|e| Error::BadGateway(format!("cannot invoke compiler: {e}")))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(Error::BadGateway(format!(
            "compilation failed: {}",
            stderr.trim()
        )));
    }
    Ok(())
}

/// Writes a single-file payload, executable when it looks native.
fn write_exec_file(path: &Path, payload: &[u8]) -> Result<()> {
    fs::write(path, payload)?;
    let mode = if is_native_bytes(payload) { 0o755 } else { 0o644 };
    fs::set_permissions(path, fs::Permissions::from_mode(mode))?;
    Ok(())
}

/// Unpacks a gzip'd tarball into `dst`.
fn unpack_tar_gz(payload: &[u8], dst: &Path) -> Result<()> {
    let mut archive = tar::Archive::new(GzDecoder::new(payload));
    archive.set_preserve_permissions(true);
    archive.set_overwrite(true);
    archive
        .unpack(dst)
        .map_err(|e| Error::BadRequest(format!("cannot extract the archive: {e}")))?;
    Ok(())
}

fn is_gzip(payload: &[u8]) -> bool {
    payload.starts_with(&[0x1f, 0x8b])
}

/// `true` when the file starts with an ELF magic or a shebang.
fn is_native(path: &Path) -> bool {
    let Ok(head) = read_head(path) else {
        return false;
    };
    is_native_bytes(&head)
}

fn is_native_bytes(head: &[u8]) -> bool {
    head.starts_with(b"\x7fELF") || head.starts_with(b"#!")
}

fn read_head(path: &Path) -> std::io::Result<Vec<u8>> {
    use std::io::Read;
    let mut head = [0u8; 4];
    let mut file = fs::File::open(path)?;
    let n = file.read(&mut head)?;
    Ok(head[..n].to_vec())
}
