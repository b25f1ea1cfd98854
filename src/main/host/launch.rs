//! Starting a variant under ptrace.
//!
//! The variant is forked from the management thread and stopped before it executes anything.
//! The management thread then detaches, leaving the variant stopped, and queues it so that the
//! primary monitor can attach once it's running.

use std::collections::BTreeMap;
use std::ffi::CString;
use std::path::{Path, PathBuf};

use anyhow::Context;
use nix::sys::ptrace;
use nix::sys::signal::{self, Signal};
use nix::sys::wait::{waitpid, WaitStatus};
use nix::unistd::{ForkResult, Pid};

use crate::core::configuration::VariantSpec;
use crate::host::tracer::AttachContext;
use crate::utility::os::{normalize_path, InterpCache, MVEE_ROOT_ENV};
use crate::utility::special_files::SpecialFiles;

/// Everything needed to execute a variant, prepared before forking.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchCommand {
    pub program: PathBuf,
    pub argv: Vec<String>,
    /// `KEY=VALUE` strings.
    pub env: Vec<String>,
    pub pwd: Option<PathBuf>,
}

/// Apply the configured environment changes to `current`.
///
/// Each override is `KEY=VALUE`. A non-empty value is prepended to an existing value, separated
/// by `:`, so that search paths can be extended. An empty value removes `KEY`. Overrides without
/// a `=` are ignored. [`MVEE_ROOT_ENV`] is always set to `root_dir`.
pub fn build_env(
    overrides: &[String],
    current: impl IntoIterator<Item = (String, String)>,
    root_dir: &Path,
) -> Vec<String> {
    let mut env: BTreeMap<String, String> = current.into_iter().collect();

    for entry in overrides {
        let Some((key, value)) = entry.split_once('=') else {
            log::warn!("Ignoring environment entry without '=': {entry:?}");
            continue;
        };

        if value.is_empty() {
            env.remove(key);
            continue;
        }

        let value = match env.get(key) {
            Some(old) if !old.is_empty() => format!("{value}:{old}"),
            _ => value.to_string(),
        };
        env.insert(key.to_string(), value);
    }

    env.insert(
        MVEE_ROOT_ENV.to_string(),
        root_dir.to_string_lossy().into_owned(),
    );

    env.into_iter().map(|(k, v)| format!("{k}={v}")).collect()
}

/// The program to execute and its arguments.
///
/// Without an interpreter, argv[0] is the file name of `path`. With one, the interpreter is
/// executed instead, followed by its arguments and the full `path`.
pub fn build_argv(
    path: &Path,
    args: &[String],
    interp: Option<&[String]>,
) -> (PathBuf, Vec<String>) {
    match interp.filter(|x| !x.is_empty()) {
        Some(interp) => {
            let argv = interp
                .iter()
                .cloned()
                .chain(std::iter::once(path.to_string_lossy().into_owned()))
                .chain(args.iter().cloned())
                .collect();
            (PathBuf::from(&interp[0]), argv)
        }
        None => {
            let name = path
                .file_name()
                .map(|x| x.to_string_lossy().into_owned())
                .unwrap_or_else(|| path.to_string_lossy().into_owned());
            let argv = std::iter::once(name).chain(args.iter().cloned()).collect();
            (path.to_path_buf(), argv)
        }
    }
}

pub struct Launcher {
    root_dir: PathBuf,
    interps: InterpCache,
    special_files: Option<SpecialFiles>,
}

impl Launcher {
    /// With `special_files`, variant binaries are executed from private copies.
    pub fn new(root_dir: PathBuf, special_files: Option<SpecialFiles>) -> Self {
        Self {
            root_dir,
            interps: InterpCache::new(),
            special_files,
        }
    }

    pub fn prepare(&self, spec: &VariantSpec) -> anyhow::Result<LaunchCommand> {
        let path = normalize_path(&spec.path)
            .with_context(|| format!("Failed to normalize path {:?}", spec.path))?;

        let interp = self
            .interps
            .get(&path)
            .with_context(|| format!("Failed to read variant binary {}", path.display()))?;

        let (mut program, mut argv) = build_argv(&path, &spec.argv, interp.as_deref());

        // the copy is only what gets executed; argv keeps the name of the original binary
        if let Some(special_files) = &self.special_files {
            let copy = special_files
                .create_special_file(&path)
                .with_context(|| format!("Failed to copy {}", path.display()))?;
            match interp.as_deref().filter(|x| !x.is_empty()) {
                // the interpreter reads the script from the path that follows its own arguments
                Some(interp) => argv[interp.len()] = copy.to_string_lossy().into_owned(),
                None => program = copy,
            }
        }

        let env = build_env(&spec.env, std::env::vars(), &self.root_dir);
        let pwd = spec
            .pwd
            .as_ref()
            .map(normalize_path)
            .transpose()
            .context("Failed to normalize the working directory")?;

        Ok(LaunchCommand {
            program,
            argv,
            env,
            pwd,
        })
    }

    /// Start variant `spec`, stopped and not traced by anyone. The returned context is for the
    /// monitor that attaches to it.
    pub fn launch_variant(&self, spec: &VariantSpec) -> anyhow::Result<(Pid, AttachContext)> {
        let cmd = self.prepare(spec)?;
        log::info!(
            "Launching variant '{}': {} {:?}",
            spec.id,
            cmd.program.display(),
            cmd.argv
        );

        // allocate everything before forking
        let program = to_cstring(cmd.program.to_string_lossy().as_ref())?;
        let argv = cmd
            .argv
            .iter()
            .map(|x| to_cstring(x))
            .collect::<anyhow::Result<Vec<_>>>()?;
        let env = cmd
            .env
            .iter()
            .map(|x| to_cstring(x))
            .collect::<anyhow::Result<Vec<_>>>()?;
        let pwd = cmd
            .pwd
            .map(|x| to_cstring(x.to_string_lossy().as_ref()))
            .transpose()?;

        // SAFETY: the child only makes async-signal-safe calls before exec
        let pid = match unsafe { nix::unistd::fork() }.context("Failed to fork the variant")? {
            ForkResult::Child => exec_child(&program, &argv, &env, pwd.as_ref()),
            ForkResult::Parent { child } => child,
        };

        match waitpid(pid, None).context("Failed to wait for the variant")? {
            WaitStatus::Stopped(_, Signal::SIGSTOP) => {}
            status => anyhow::bail!("Variant '{}' didn't start: {status:?}", spec.id),
        }

        if let Err(e) = ptrace::detach(pid, Some(Signal::SIGSTOP)) {
            signal::kill(pid, Signal::SIGKILL).ok();
            return Err(e).context("Failed to detach from the variant");
        }

        log::debug!("Variant '{}' is pid {pid}", spec.id);
        Ok((pid, AttachContext::initial()))
    }
}

fn to_cstring(s: &str) -> anyhow::Result<CString> {
    CString::new(s).with_context(|| format!("String contains a nul byte: {s:?}"))
}

fn exec_child(program: &CString, argv: &[CString], env: &[CString], pwd: Option<&CString>) -> ! {
    let _ = ptrace::traceme();
    let _ = signal::raise(Signal::SIGSTOP);

    if let Some(pwd) = pwd {
        if nix::unistd::chdir(pwd.as_c_str()).is_err() {
            unsafe { libc::_exit(126) };
        }
    }

    let _ = nix::unistd::execve(program, argv, env);
    unsafe { libc::_exit(127) }
}

#[cfg(test)]
mod tests {
    use std::io::Write;
    use std::sync::Arc;

    use super::*;
    use crate::host::syscall::locks::GlobalLocks;

    fn special_files(dir: &Path) -> SpecialFiles {
        SpecialFiles::new(dir, Arc::new(GlobalLocks::new())).unwrap()
    }

    fn strings(x: &[&str]) -> Vec<String> {
        x.iter().map(|x| x.to_string()).collect()
    }

    #[test]
    fn test_build_env() {
        let current = vec![
            ("PATH".to_string(), "/usr/bin".to_string()),
            ("HOME".to_string(), "/root".to_string()),
            ("EMPTY".to_string(), "".to_string()),
        ];
        let overrides = strings(&[
            "PATH=/opt/bin",
            "HOME=",
            "EMPTY=x",
            "NEW=1",
            "garbage",
            "MVEEROOT=/ignored",
        ]);

        let env = build_env(&overrides, current, Path::new("/srv/mvee"));
        assert_eq!(
            env,
            strings(&[
                "EMPTY=x",
                "MVEEROOT=/srv/mvee",
                "NEW=1",
                "PATH=/opt/bin:/usr/bin",
            ])
        );
    }

    #[test]
    fn test_build_env_no_overrides() {
        let env = build_env(&[], Vec::new(), Path::new("/"));
        assert_eq!(env, strings(&["MVEEROOT=/"]));
    }

    #[test]
    fn test_build_argv() {
        let (program, argv) = build_argv(Path::new("/usr/bin/ls"), &strings(&["-l", "/"]), None);
        assert_eq!(program, PathBuf::from("/usr/bin/ls"));
        assert_eq!(argv, strings(&["ls", "-l", "/"]));

        let interp = strings(&["/bin/bash", "-e"]);
        let (program, argv) = build_argv(Path::new("/opt/run.sh"), &strings(&["x"]), Some(&interp));
        assert_eq!(program, PathBuf::from("/bin/bash"));
        assert_eq!(argv, strings(&["/bin/bash", "-e", "/opt/run.sh", "x"]));
    }

    fn spec(path: &Path) -> VariantSpec {
        VariantSpec {
            id: "test".into(),
            path: path.to_string_lossy().into_owned(),
            argv: strings(&["a"]),
            pwd: Some("/tmp/../tmp".into()),
            env: strings(&["MVEE_TEST_VAR=1"]),
        }
    }

    #[test]
    fn test_prepare_script() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run");
        let mut file = std::fs::File::create(&path).unwrap();
        file.write_all(b"#!/bin/sh\n").unwrap();

        let launcher = Launcher::new(PathBuf::from("/srv/mvee"), None);
        let cmd = launcher.prepare(&spec(&path)).unwrap();

        assert_eq!(cmd.program, PathBuf::from("/bin/sh"));
        assert_eq!(
            cmd.argv,
            vec!["/bin/sh".to_string(), path.to_string_lossy().into_owned(), "a".into()]
        );
        assert_eq!(cmd.pwd, Some(PathBuf::from("/tmp")));
        assert!(cmd.env.contains(&"MVEEROOT=/srv/mvee".to_string()));
        assert!(cmd.env.contains(&"MVEE_TEST_VAR=1".to_string()));
    }

    #[test]
    fn test_prepare_special_file() {
        let special_dir = tempfile::tempdir().unwrap();
        let special = special_files(special_dir.path());
        let launcher = Launcher::new(PathBuf::from("/"), Some(special));

        let exe = std::env::current_exe().unwrap();
        let cmd = launcher.prepare(&spec(&exe)).unwrap();

        assert!(cmd.program.starts_with(special_dir.path()));
        assert_ne!(cmd.program, exe);
        assert_eq!(cmd.argv[0], exe.file_name().unwrap().to_str().unwrap());
        assert_eq!(&cmd.argv[1..], ["a"]);
    }

    #[test]
    fn test_prepare_special_file_keeps_name() {
        let special_dir = tempfile::tempdir().unwrap();
        let special = special_files(special_dir.path());
        let launcher = Launcher::new(PathBuf::from("/"), Some(special));

        let cmd = launcher.prepare(&spec(Path::new("/bin/true"))).unwrap();

        assert!(cmd.program.starts_with(special_dir.path()));
        assert_eq!(cmd.argv[0], "true");
    }

    #[test]
    fn test_prepare_special_script() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run");
        let mut file = std::fs::File::create(&path).unwrap();
        file.write_all(b"#!/bin/sh\n").unwrap();
        drop(file);

        let special_dir = tempfile::tempdir().unwrap();
        let special = special_files(special_dir.path());
        let launcher = Launcher::new(PathBuf::from("/"), Some(special));

        let cmd = launcher.prepare(&spec(&path)).unwrap();

        // the interpreter itself is not copied, the script is
        assert_eq!(cmd.program, PathBuf::from("/bin/sh"));
        assert_eq!(cmd.argv[0], "/bin/sh");
        assert!(Path::new(&cmd.argv[1]).starts_with(special_dir.path()));
        assert_eq!(cmd.argv[2], "a");
    }

    #[test]
    fn test_prepare_missing() {
        let launcher = Launcher::new(PathBuf::from("/"), None);
        assert!(launcher
            .prepare(&spec(Path::new("/nonexistent/binary")))
            .is_err());
    }
}
