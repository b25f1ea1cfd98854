//! Helpers for inspecting the host: paths, interpreters, and `/proc`.

use std::collections::HashMap;
use std::ffi::OsString;
use std::io::{BufRead, Read};
use std::path::{Component, Path, PathBuf};
use std::sync::Mutex;

use nix::unistd::Pid;

/// The environment variable that overrides the supervisor's root directory.
pub const MVEE_ROOT_ENV: &str = "MVEEROOT";

/// Make `path` absolute against the current working directory and remove `.`, `..`, and repeated
/// separators. Doesn't touch the filesystem, so symlinks aren't resolved.
pub fn normalize_path(path: impl AsRef<Path>) -> std::io::Result<PathBuf> {
    Ok(normalize_path_from(&std::env::current_dir()?, path.as_ref()))
}

/// Like [`normalize_path`], but relative to `base` instead of the working directory.
pub fn normalize_path_from(base: &Path, path: &Path) -> PathBuf {
    let mut normalized = PathBuf::from("/");

    let joined;
    let path = if path.is_absolute() {
        path
    } else {
        joined = base.join(path);
        &joined
    };

    for component in path.components() {
        match component {
            Component::RootDir | Component::CurDir | Component::Prefix(_) => {}
            Component::ParentDir => {
                // `/..` is `/`
                normalized.pop();
            }
            Component::Normal(x) => normalized.push(x),
        }
    }

    normalized
}

/// The directory that contains the supervisor's support files. This is the value of `MVEEROOT`
/// if set, otherwise the directory two levels above the supervisor's executable.
pub fn get_mvee_root_dir() -> std::io::Result<PathBuf> {
    let exe = std::env::current_exe()?;
    Ok(mvee_root_dir_from(std::env::var_os(MVEE_ROOT_ENV), &exe))
}

fn mvee_root_dir_from(env: Option<OsString>, exe: &Path) -> PathBuf {
    if let Some(root) = env.filter(|x| !x.is_empty()) {
        return PathBuf::from(root);
    }

    exe.ancestors()
        .nth(2)
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("/"))
}

/// The interpreter (with its arguments) needed to execute `file`, or `None` if the file can be
/// executed directly.
///
/// ELF files don't need an interpreter. Otherwise the file's hashbang line is used, and failing
/// that its extension (`.sh` and `.rb` are supported).
pub fn get_interp_for_file(file: &Path) -> std::io::Result<Option<Vec<String>>> {
    let mut reader = std::io::BufReader::new(std::fs::File::open(file)?);

    let mut magic = [0u8; 4];
    let mut read = 0;
    while read < magic.len() {
        match reader.read(&mut magic[read..])? {
            0 => break,
            n => read += n,
        }
    }

    if magic == *b"\x7fELF" {
        return Ok(None);
    }

    if magic[..read].starts_with(b"#!") {
        let mut line = String::new();
        reader.read_line(&mut line)?;
        // skip the "#!" that was already consumed as part of the magic
        let header = String::from_utf8_lossy(&magic[2..read]).into_owned() + &line;
        if let Some(interp) = parse_hashbang(&header) {
            return Ok(Some(interp));
        }
    }

    match file.extension().and_then(|x| x.to_str()) {
        Some("sh") => Ok(Some(vec!["/bin/sh".to_string()])),
        Some("rb") => Ok(Some(vec![which_str("ruby")?])),
        _ => Ok(None),
    }
}

/// Parse the part of a hashbang line after the `#!`. Like the kernel, everything after the
/// interpreter is passed as a single argument, except that `/usr/bin/env` is resolved here.
fn parse_hashbang(line: &str) -> Option<Vec<String>> {
    let line = line.trim();
    let (interp, arg) = match line.split_once(char::is_whitespace) {
        Some((interp, arg)) => (interp, Some(arg.trim()).filter(|x| !x.is_empty())),
        None => (line, None),
    };

    if interp.is_empty() {
        return None;
    }

    if Path::new(interp).file_name() == Some(std::ffi::OsStr::new("env")) {
        if let Some(arg) = arg {
            let mut words = arg.split_whitespace();
            let program = words.next()?;
            let resolved = which_str(program).unwrap_or_else(|_| program.to_string());
            return Some(
                std::iter::once(resolved)
                    .chain(words.map(str::to_string))
                    .collect(),
            );
        }
    }

    Some(
        std::iter::once(interp.to_string())
            .chain(arg.map(str::to_string))
            .collect(),
    )
}

fn which_str(program: &str) -> std::io::Result<String> {
    let path = which::which(program).map_err(|e| {
        std::io::Error::new(
            std::io::ErrorKind::NotFound,
            format!("Could not find '{program}': {e}"),
        )
    })?;
    Ok(path.to_string_lossy().into_owned())
}

/// A cache of [`get_interp_for_file`] results.
#[derive(Debug, Default)]
pub struct InterpCache {
    interps: Mutex<HashMap<PathBuf, Option<Vec<String>>>>,
}

impl InterpCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, file: &Path) -> std::io::Result<Option<Vec<String>>> {
        if let Some(interp) = self.interps.lock().unwrap().get(file) {
            return Ok(interp.clone());
        }

        let interp = get_interp_for_file(file)?;
        self.register(file, interp.clone());
        Ok(interp)
    }

    pub fn register(&self, file: &Path, interp: Option<Vec<String>>) {
        self.interps
            .lock()
            .unwrap()
            .insert(file.to_path_buf(), interp);
    }
}

const PTRACE_SCOPE_PATH: &str = "/proc/sys/kernel/yama/ptrace_scope";

/// Check that the Yama ptrace scope allows us to trace the variants. Returns the current scope,
/// or `None` if the Yama module isn't enabled.
pub fn check_ptrace_scope() -> Option<u32> {
    let scope = std::fs::read_to_string(PTRACE_SCOPE_PATH).ok()?;
    let scope = match scope.trim().parse::<u32>() {
        Ok(x) => x,
        Err(e) => {
            log::warn!("Could not parse {PTRACE_SCOPE_PATH}: {e}");
            return None;
        }
    };

    match scope {
        0 | 1 => log::debug!("ptrace scope is {scope}"),
        2 => log::warn!(
            "ptrace scope is 2; the supervisor needs CAP_SYS_PTRACE to trace its variants"
        ),
        _ => log::warn!("ptrace scope is {scope}; the variants can't be traced"),
    }

    Some(scope)
}

/// The thread group id of `pid`, read from `/proc/<pid>/status`.
pub fn read_tgid(pid: Pid) -> std::io::Result<Pid> {
    let status = std::fs::read_to_string(format!("/proc/{pid}/status"))?;
    parse_tgid(&status).ok_or_else(|| {
        std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("No Tgid in the status of {pid}"),
        )
    })
}

fn parse_tgid(status: &str) -> Option<Pid> {
    status
        .lines()
        .find_map(|line| line.strip_prefix("Tgid:"))
        .and_then(|x| x.trim().parse().ok())
        .map(Pid::from_raw)
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    #[test]
    fn test_normalize() {
        let base = Path::new("/home/user");
        let check = |path: &str, expected: &str| {
            assert_eq!(
                normalize_path_from(base, Path::new(path)),
                PathBuf::from(expected),
                "{path}"
            );
        };

        check("bin/app", "/home/user/bin/app");
        check("./bin//app", "/home/user/bin/app");
        check("../other/./app", "/home/other/app");
        check("/usr//bin/../lib/", "/usr/lib");
        check("/../../x", "/x");
        check(".", "/home/user");
    }

    #[test]
    fn test_normalize_cwd() {
        let path = normalize_path("foo/../bar").unwrap();
        assert!(path.is_absolute());
        assert_eq!(path, std::env::current_dir().unwrap().join("bar"));
    }

    #[test]
    fn test_root_dir() {
        let exe = Path::new("/opt/mvee/build/bin/mvee");
        assert_eq!(mvee_root_dir_from(None, exe), PathBuf::from("/opt/mvee/build"));
        assert_eq!(
            mvee_root_dir_from(Some("/srv/root".into()), exe),
            PathBuf::from("/srv/root")
        );
        assert_eq!(
            mvee_root_dir_from(Some("".into()), exe),
            PathBuf::from("/opt/mvee/build")
        );
        assert_eq!(mvee_root_dir_from(None, Path::new("/mvee")), PathBuf::from("/"));
    }

    fn script(name: &str, contents: &str) -> (tempfile::TempDir, PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(name);
        let mut file = std::fs::File::create(&path).unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        (dir, path)
    }

    #[test]
    fn test_interp_elf() {
        let exe = std::env::current_exe().unwrap();
        assert_eq!(get_interp_for_file(&exe).unwrap(), None);
    }

    #[test]
    fn test_interp_hashbang() {
        let (_dir, path) = script("run", "#!/bin/bash -e -u\necho hi\n");
        assert_eq!(
            get_interp_for_file(&path).unwrap(),
            Some(vec!["/bin/bash".to_string(), "-e -u".to_string()])
        );

        let (_dir, path) = script("run.sh", "#! /bin/dash\n");
        assert_eq!(
            get_interp_for_file(&path).unwrap(),
            Some(vec!["/bin/dash".to_string()])
        );
    }

    #[test]
    fn test_interp_env() {
        let (_dir, path) = script("run", "#!/usr/bin/env sh\n");
        let interp = get_interp_for_file(&path).unwrap().unwrap();
        assert_eq!(interp.len(), 1);
        assert!(Path::new(&interp[0]).is_absolute());
        assert!(interp[0].ends_with("sh"));
    }

    #[test]
    fn test_interp_extension() {
        let (_dir, path) = script("build.sh", "echo hi\n");
        assert_eq!(
            get_interp_for_file(&path).unwrap(),
            Some(vec!["/bin/sh".to_string()])
        );

        let (_dir, path) = script("data.txt", "hello\n");
        assert_eq!(get_interp_for_file(&path).unwrap(), None);

        let (_dir, path) = script("empty", "");
        assert_eq!(get_interp_for_file(&path).unwrap(), None);
    }

    #[test]
    fn test_interp_cache() {
        let cache = InterpCache::new();
        let (dir, path) = script("run", "#!/bin/sh\n");
        assert_eq!(
            cache.get(&path).unwrap(),
            Some(vec!["/bin/sh".to_string()])
        );

        // served from the cache once the file is gone
        drop(dir);
        assert!(get_interp_for_file(&path).is_err());
        assert_eq!(
            cache.get(&path).unwrap(),
            Some(vec!["/bin/sh".to_string()])
        );
    }

    #[test]
    fn test_parse_hashbang() {
        assert_eq!(parse_hashbang(""), None);
        assert_eq!(parse_hashbang("   \n"), None);
        assert_eq!(
            parse_hashbang("/usr/bin/python3\n"),
            Some(vec!["/usr/bin/python3".to_string()])
        );
    }

    #[test]
    fn test_tgid() {
        assert_eq!(
            parse_tgid("Name:\tcat\nTgid:\t4242\nPid:\t4243\n"),
            Some(Pid::from_raw(4242))
        );
        assert_eq!(parse_tgid("Name:\tcat\n"), None);

        let pid = nix::unistd::getpid();
        assert_eq!(read_tgid(pid).unwrap(), pid);

        // threads report the id of their thread group
        let (tid, tgid) = std::thread::spawn(|| {
            let tid = nix::unistd::gettid();
            (tid, read_tgid(tid).unwrap())
        })
        .join()
        .unwrap();
        assert_ne!(tid, pid);
        assert_eq!(tgid, pid);
    }
}
