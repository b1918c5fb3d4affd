use std::collections::VecDeque;
use std::fs;
use std::io::{Read, Write};
use std::path::{Component, Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::mpsc::{self, Receiver};
use std::thread;
use std::time::{Duration, Instant};

const EXIT_POLL: Duration = Duration::from_millis(50);
/// How long a killed run may take to hand over its remaining output.
const DRAIN_GRACE: Duration = Duration::from_millis(500);
const READ_CHUNK: usize = 8 * 1024;

/// Shorten `text` to at most `max` characters, marking the cut with `...`.
pub fn clip(text: &str, max: usize) -> String {
    let mut indices = text.char_indices();
    match indices.nth(max) {
        None => text.to_string(),
        Some(_) if max <= 3 => text.chars().take(max).collect(),
        Some(_) => {
            let keep: String = text.chars().take(max - 3).collect();
            keep + "..."
        }
    }
}

/// The last `max` characters of `text`.
pub fn keep_tail(text: &str, max: usize) -> &str {
    if max == 0 {
        return "";
    }
    match text.char_indices().rev().nth(max - 1) {
        Some((start, _)) => &text[start..],
        None => text,
    }
}

/// What a finished (or killed) child left behind.
#[derive(Debug)]
pub struct Captured {
    pub status: Option<ExitStatus>,
    pub stdout: String,
    pub stderr: String,
    pub timed_out: bool,
    pub elapsed: Duration,
}

impl Captured {
    pub fn exited_cleanly(&self) -> bool {
        !self.timed_out && matches!(self.status, Some(status) if status.success())
    }
}

/// Run `command` with stdin closed, killing it when `budget` runs out.
///
/// On unix the child leads its own process group and the whole group is
/// killed, so tools started by `sh -c` or `make` go with it. Each stream
/// keeps only its last `capture_limit` bytes.
pub fn run_bounded(
    command: &mut Command,
    budget: Duration,
    capture_limit: usize,
) -> Result<Captured, String> {
    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        command.process_group(0);
    }

    let started = Instant::now();
    let mut child = command
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|e| format!("could not start process: {}", e))?;

    let stdout = child.stdout.take().map(|s| drain_tail(s, capture_limit));
    let stderr = child.stderr.take().map(|s| drain_tail(s, capture_limit));

    let (status, timed_out) = wait_until(&mut child, started + budget)?;
    let patience = timed_out.then_some(DRAIN_GRACE);

    Ok(Captured {
        status,
        stdout: collect(stdout, patience),
        stderr: collect(stderr, patience),
        timed_out,
        elapsed: started.elapsed(),
    })
}

fn wait_until(child: &mut Child, deadline: Instant) -> Result<(Option<ExitStatus>, bool), String> {
    loop {
        if let Some(status) = child
            .try_wait()
            .map_err(|e| format!("could not wait for process: {}", e))?
        {
            return Ok((Some(status), false));
        }
        if Instant::now() >= deadline {
            kill_group(child);
            return Ok((child.wait().ok(), true));
        }
        thread::sleep(EXIT_POLL);
    }
}

fn kill_group(child: &mut Child) {
    #[cfg(unix)]
    {
        if let Ok(pgid) = libc::pid_t::try_from(child.id()) {
            // SAFETY: only sends a signal to the group this child leads.
            unsafe {
                libc::kill(-pgid, libc::SIGKILL);
            }
        }
    }
    let _ = child.kill();
}

fn drain_tail<R: Read + Send + 'static>(mut source: R, limit: usize) -> Receiver<Vec<u8>> {
    let (tx, rx) = mpsc::channel();
    thread::spawn(move || {
        let mut kept: VecDeque<u8> = VecDeque::new();
        let mut chunk = [0u8; READ_CHUNK];
        while let Ok(n) = source.read(&mut chunk) {
            if n == 0 {
                break;
            }
            kept.extend(&chunk[..n]);
            let overflow = kept.len().saturating_sub(limit);
            kept.drain(..overflow);
        }
        let _ = tx.send(kept.into());
    });
    rx
}

/// Output gathered by a reader. With `patience`, a reader still held open by
/// an escaped descendant is abandoned after that long.
fn collect(reader: Option<Receiver<Vec<u8>>>, patience: Option<Duration>) -> String {
    let bytes = reader
        .and_then(|rx| match patience {
            Some(wait) => rx.recv_timeout(wait).ok(),
            None => rx.recv().ok(),
        })
        .unwrap_or_default();
    String::from_utf8_lossy(&bytes).into_owned()
}

/// A file location inside the project, possibly not created yet.
#[derive(Debug, Clone)]
pub struct ProjectPath {
    pub absolute: PathBuf,
    pub relative: PathBuf,
}

/// Resolve a manifest or compiler path against `project_root`.
///
/// Only plain relative paths are accepted. The closest existing ancestor
/// must sit under the root once links are followed, and no existing part
/// of the path, the target included, may itself be a symlink.
pub fn resolve_in_project(project_root: &Path, candidate: &Path) -> Result<ProjectPath, String> {
    let mut relative = PathBuf::new();
    for component in candidate.components() {
        match component {
            Component::Normal(part) => relative.push(part),
            Component::CurDir => {}
            _ => {
                return Err(format!(
                    "path must stay inside the project: {}",
                    candidate.display()
                ))
            }
        }
    }
    if relative.as_os_str().is_empty() {
        return Err(format!("empty path: {:?}", candidate));
    }

    let root = project_root
        .canonicalize()
        .map_err(|e| format!("project root {}: {}", project_root.display(), e))?;
    let absolute = root.join(&relative);

    let anchor = absolute
        .ancestors()
        .skip(1)
        .find(|dir| dir.exists())
        .ok_or_else(|| format!("no existing directory above {}", candidate.display()))?;
    let anchor = anchor
        .canonicalize()
        .map_err(|e| format!("{}: {}", anchor.display(), e))?;
    if !anchor.starts_with(&root) {
        return Err(format!(
            "path leaves the project through a link: {}",
            candidate.display()
        ));
    }

    let mut walked = root.clone();
    for part in relative.iter() {
        walked.push(part);
        match fs::symlink_metadata(&walked) {
            Ok(meta) if meta.file_type().is_symlink() => {
                return Err(format!(
                    "symlinks cannot be written through: {}",
                    walked.display()
                ))
            }
            Ok(_) => {}
            Err(_) => break,
        }
    }

    Ok(ProjectPath { absolute, relative })
}

/// Replace `path` with `content` by writing a hidden sibling and renaming it.
pub fn write_atomic(path: &Path, content: &str) -> anyhow::Result<()> {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "state".to_string());
    let staging = path.with_file_name(format!(".{}.partial", name));

    let written = (|| -> std::io::Result<()> {
        let mut file = fs::File::create(&staging)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            file.set_permissions(fs::Permissions::from_mode(0o600))?;
        }
        file.write_all(content.as_bytes())?;
        file.sync_all()?;
        fs::rename(&staging, path)
    })();

    if written.is_err() {
        let _ = fs::remove_file(&staging);
    }
    Ok(written?)
}

/// Add `entry` to an ignore file once, under a short marker comment.
pub fn ensure_ignored(ignore_file: &Path, entry: &str) -> anyhow::Result<()> {
    let existing = fs::read_to_string(ignore_file).unwrap_or_default();
    let wanted = entry.trim_end_matches('/');
    if existing
        .lines()
        .map(|line| line.trim().trim_end_matches('/'))
        .any(|line| line == wanted)
    {
        return Ok(());
    }

    let mut addition = String::new();
    if !existing.is_empty() && !existing.ends_with('\n') {
        addition.push('\n');
    }
    addition.push_str("# restage run state\n");
    addition.push_str(entry);
    addition.push('\n');

    fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(ignore_file)?
        .write_all(addition.as_bytes())?;
    Ok(())
}
