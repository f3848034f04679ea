//! Command interception and rewriting.
//!
//! Every raw command goes through [`RULES`] in order. A rule either edits
//! the command in place or settles the request with an [`EarlyResponse`],
//! in which case nothing is executed.

use crate::paths::{resolve_in_home, shell_quote};
use regex::Regex;
use std::fs;
use std::io;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use tracing::{debug, warn};

/// Substrings that refuse a command outright.
pub const DENYLIST: &[&str] = &[
    "sudo ",
    "su ",
    "chmod 777 ",
    "chmod -R 777 ",
    "rm -rf /",
    "dd if=/dev/zero",
    "> /dev/sda",
    ":(){ :|:& };:",
];

/// Leading programs refused when system commands are disabled.
pub const SYSTEM_PREFIXES: &[&str] = &["apt", "apt-get", "yum", "dnf", "pacman", "systemctl", "service"];

/// Programs that block on stdin.
pub const INTERACTIVE_TOOLS: &[&str] = &[
    "openssl",
    "ssh-keygen",
    "ssh",
    "mysql",
    "psql",
    "sqlite3",
    "passwd",
    "gpg",
    "ftp",
    "telnet",
];

pub const EDITORS: &[&str] = &["nano", "vim", "vi", "emacs", "pico", "micro", "joe"];

const CRYPTO_TOOL: &str = "openssl";
const CRYPTO_WRAPPER: &str = "openssl-wrapper";

/// Built-in name -> helper script in `~/.local/bin`.
const BUILTINS: &[(&str, &str)] = &[
    ("help", "show-help"),
    ("install-python", "install-python-pip"),
    ("install-node", "install-node-npm"),
    ("session-keep-alive", "session-keep-alive"),
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rule {
    BuiltIn,
    EditorIntercept,
    PromptStrip,
    InterpreterWrap,
    CryptoWrap,
    PackageRedirect,
    Denylist,
    InteractiveFlag,
}

pub const RULES: [Rule; 8] = [
    Rule::BuiltIn,
    Rule::EditorIntercept,
    Rule::PromptStrip,
    Rule::InterpreterWrap,
    Rule::CryptoWrap,
    Rule::PackageRedirect,
    Rule::Denylist,
    Rule::InteractiveFlag,
];

/// A request settled without running anything.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EarlyResponse {
    Message { output: String, exit_code: i32 },
    Forbidden(String),
    PathTraversal(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rewrite {
    pub command: String,
    pub interactive: bool,
    pub early: Option<EarlyResponse>,
    /// Warnings shown to the caller ahead of the output.
    pub notices: Vec<String>,
    /// Already routed through a non-interactive wrapper.
    pub wrapped: bool,
}

/// Per-session facts the rules need.
#[derive(Debug, Clone)]
pub struct SessionContext {
    /// Home as seen from the host, where files are created.
    pub home: PathBuf,
    pub owner_uid: Option<u32>,
}

impl SessionContext {
    fn bin_dir(&self) -> PathBuf {
        self.home.join(".local/bin")
    }

    fn has_helper(&self, name: &str) -> bool {
        self.bin_dir().join(name).is_file()
    }
}

#[derive(Debug, Clone)]
pub struct CommandPipeline {
    allow_system_commands: bool,
    scripts_dir: PathBuf,
}

impl CommandPipeline {
    pub fn new(allow_system_commands: bool, scripts_dir: impl Into<PathBuf>) -> Self {
        Self {
            allow_system_commands,
            scripts_dir: scripts_dir.into(),
        }
    }

    /// Runs every rule. Touches the filesystem only for editor stubs and
    /// the crypto wrapper copy, so call it off the async runtime.
    pub fn rewrite(&self, raw: &str, ctx: &SessionContext) -> Rewrite {
        let mut rw = Rewrite {
            command: raw.trim().to_string(),
            interactive: false,
            early: None,
            notices: Vec::new(),
            wrapped: false,
        };
        for rule in RULES {
            self.apply(rule, raw, &mut rw, ctx);
            if rw.early.is_some() {
                debug!(rule = ?rule, "Command settled early");
                break;
            }
        }
        rw
    }

    fn apply(&self, rule: Rule, raw: &str, rw: &mut Rewrite, ctx: &SessionContext) {
        match rule {
            Rule::BuiltIn => builtin(rw, ctx),
            Rule::EditorIntercept => editor(rw, ctx),
            Rule::PromptStrip => {
                if let Some(rest) = rw.command.strip_prefix('$') {
                    rw.command = rest.trim_start().to_string();
                }
            }
            Rule::InterpreterWrap => {
                if looks_like_python(&rw.command) {
                    rw.command = format!("python3 -c {}", shell_quote(&rw.command));
                }
            }
            Rule::CryptoWrap => self.crypto_wrap(rw, ctx),
            Rule::PackageRedirect => package_redirect(rw, ctx),
            Rule::Denylist => {
                if let Some(reason) = self.denied(raw, &rw.command) {
                    rw.early = Some(EarlyResponse::Forbidden(reason));
                }
            }
            Rule::InteractiveFlag => {
                let program = first_word(&rw.command);
                rw.interactive = !rw.wrapped && INTERACTIVE_TOOLS.contains(&program);
            }
        }
    }

    fn crypto_wrap(&self, rw: &mut Rewrite, ctx: &SessionContext) {
        if first_word(&rw.command) != CRYPTO_TOOL {
            return;
        }
        match self.install_wrapper(ctx) {
            Ok(()) => {
                let args = rw.command[CRYPTO_TOOL.len()..].trim_start();
                rw.command = format!("/bin/bash \"$HOME/.local/bin/{CRYPTO_WRAPPER}\" {args}")
                    .trim_end()
                    .to_string();
                rw.wrapped = true;
            }
            Err(e) => {
                warn!(error = %e, "Crypto wrapper unavailable, running command directly");
                rw.notices.push(
                    "Warning: OpenSSL wrapper script not found. Using direct OpenSSL command.".to_string(),
                );
            }
        }
    }

    fn install_wrapper(&self, ctx: &SessionContext) -> io::Result<()> {
        let dest = ctx.bin_dir().join(CRYPTO_WRAPPER);
        if dest.is_file() {
            return Ok(());
        }
        fs::create_dir_all(ctx.bin_dir())?;
        fs::copy(self.scripts_dir.join(CRYPTO_WRAPPER), &dest)?;
        fs::set_permissions(&dest, fs::Permissions::from_mode(0o755))?;
        give_to_owner(&dest, ctx.owner_uid);
        Ok(())
    }

    fn denied(&self, raw: &str, rewritten: &str) -> Option<String> {
        for candidate in [raw, rewritten] {
            if let Some(bad) = DENYLIST.iter().find(|bad| candidate.contains(*bad)) {
                return Some(format!("Command contains disallowed operation: {}", bad.trim_end()));
            }
        }
        if !self.allow_system_commands {
            for candidate in [raw.trim(), rewritten] {
                let program = first_word(candidate);
                if SYSTEM_PREFIXES.contains(&program) {
                    return Some(format!("System command not allowed: {program}"));
                }
            }
        }
        None
    }
}

fn builtin(rw: &mut Rewrite, ctx: &SessionContext) {
    let Some((name, helper)) = BUILTINS.iter().find(|(name, _)| rw.command == *name) else {
        return;
    };
    if ctx.has_helper(helper) {
        rw.command = format!("bash \"$HOME/.local/bin/{helper}\"");
        return;
    }
    let output = match *name {
        "help" if ctx.home.join("help.txt").is_file() => {
            rw.command = "cat \"$HOME/help.txt\"".to_string();
            return;
        }
        "help" => "Run commands as you would in bash. Files in your home directory persist for the session.\n".to_string(),
        "session-keep-alive" => "Session kept alive.\n".to_string(),
        other => format!("{other} is not available in this environment.\n"),
    };
    rw.early = Some(EarlyResponse::Message { output, exit_code: 0 });
}

fn editor(rw: &mut Rewrite, ctx: &SessionContext) {
    let mut words = rw.command.split_whitespace();
    let Some(program) = words.next() else {
        return;
    };
    if !EDITORS.contains(&program) {
        return;
    }
    let Some(target) = words.find(|w| !w.starts_with('-')) else {
        rw.early = Some(EarlyResponse::Message {
            output: format!(
                "{program} needs a terminal and is not available here. \
                 Create files with: echo \"text\" > filename\n"
            ),
            exit_code: 0,
        });
        return;
    };

    let path = match resolve_in_home(&ctx.home, target) {
        Ok(path) => path,
        Err(_) => {
            rw.early = Some(EarlyResponse::PathTraversal(target.to_string()));
            return;
        }
    };

    let output = match touch(&path, ctx.owner_uid) {
        Ok(true) => format!(
            "Created {target}. {program} needs a terminal and is not available here; \
             write to the file with: echo \"text\" > {target}\n"
        ),
        Ok(false) => format!(
            "{target} already exists. {program} needs a terminal and is not available here; \
             view it with: cat {target}\n"
        ),
        Err(e) => {
            rw.early = Some(EarlyResponse::Message {
                output: format!("Could not create {target}: {e}\n"),
                exit_code: 1,
            });
            return;
        }
    };
    rw.early = Some(EarlyResponse::Message { output, exit_code: 0 });
}

/// Creates an empty file. `Ok(false)` when it already existed.
fn touch(path: &Path, owner: Option<u32>) -> io::Result<bool> {
    if path.exists() {
        return Ok(false);
    }
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::OpenOptions::new().write(true).create_new(true).open(path)?;
    give_to_owner(path, owner);
    Ok(true)
}

fn give_to_owner(path: &Path, owner: Option<u32>) {
    use nix::unistd::{chown, Gid, Uid};

    if let Some(uid) = owner {
        if let Err(e) = chown(path, Some(Uid::from_raw(uid)), Some(Gid::from_raw(uid))) {
            debug!(path = %path.display(), uid, error = %e, "chown failed");
        }
    }
}

fn package_redirect(rw: &mut Rewrite, ctx: &SessionContext) {
    let program = first_word(&rw.command);
    if program == "apt" || program == "apt-get" {
        if ctx.has_helper("apt-sandbox") {
            let args = rw.command[program.len()..].trim_start();
            rw.command = format!("bash \"$HOME/.local/bin/apt-sandbox\" {args}")
                .trim_end()
                .to_string();
        }
        return;
    }

    let pip_install = ["pip install", "pip3 install"]
        .iter()
        .find(|prefix| rw.command.starts_with(*prefix));
    if let Some(prefix) = pip_install {
        let args = rw.command[prefix.len()..].to_string();
        if ctx.has_helper("pip-sandbox") {
            rw.command = format!("bash \"$HOME/.local/bin/pip-sandbox\" install{args}");
        } else if !rw.command.contains("--user") {
            rw.command = format!("{prefix} --user{args}");
        }
    }
}

fn first_word(command: &str) -> &str {
    command.split_whitespace().next().unwrap_or("")
}

fn python_patterns() -> &'static [Regex] {
    static PATTERNS: OnceLock<Vec<Regex>> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        [
            r"^print\(",
            r"^def \w+\(",
            r"^import \w",
            r"^from [\w.]+ import ",
            r"^class \w+",
            r"^[A-Za-z_]\w*\s+=\s+\S",
            r"^[A-Za-z_][\w.]*\(.*\)$",
            r"^\[[^\s\[].*\]$",
        ]
        .iter()
        .filter_map(|p| Regex::new(p).ok())
        .collect()
    })
}

/// Heuristic for Python source typed at the shell prompt.
pub fn looks_like_python(command: &str) -> bool {
    let command = command.trim();
    python_patterns().iter().any(|re| re.is_match(command))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn setup() -> (TempDir, SessionContext) {
        let dir = TempDir::new().unwrap();
        let home = dir.path().join("home");
        fs::create_dir_all(home.join(".local/bin")).unwrap();
        let ctx = SessionContext {
            home,
            owner_uid: None,
        };
        (dir, ctx)
    }

    fn pipeline(dir: &TempDir) -> CommandPipeline {
        CommandPipeline::new(true, dir.path().join("scripts"))
    }

    #[test]
    fn plain_commands_pass_through() {
        let (dir, ctx) = setup();
        let rw = pipeline(&dir).rewrite("  echo hi ", &ctx);
        assert_eq!(rw.command, "echo hi");
        assert!(rw.early.is_none());
        assert!(!rw.interactive);
    }

    #[test]
    fn denylist_blocks_before_execution() {
        let (dir, ctx) = setup();
        let rw = pipeline(&dir).rewrite("sudo rm -rf /", &ctx);
        match rw.early {
            Some(EarlyResponse::Forbidden(msg)) => assert!(msg.contains("disallowed operation")),
            other => panic!("expected forbidden, got {other:?}"),
        }
    }

    #[test]
    fn denylist_sees_through_interpreter_wrap() {
        let (dir, ctx) = setup();
        let p = pipeline(&dir);
        let direct = p.rewrite("rm -rf /", &ctx).early;
        let wrapped = p.rewrite("import os; os.system(\"rm -rf /\")", &ctx).early;
        assert_eq!(direct, wrapped);
        assert!(matches!(direct, Some(EarlyResponse::Forbidden(_))));
    }

    #[test]
    fn system_prefixes_only_blocked_when_disabled() {
        let (dir, ctx) = setup();
        let open = CommandPipeline::new(true, dir.path());
        assert!(open.rewrite("systemctl status", &ctx).early.is_none());

        let closed = CommandPipeline::new(false, dir.path());
        assert!(matches!(
            closed.rewrite("apt-get install jq", &ctx).early,
            Some(EarlyResponse::Forbidden(_))
        ));
        // "aptitude" is not "apt".
        assert!(closed.rewrite("aptitude", &ctx).early.is_none());
    }

    #[test]
    fn prompt_marker_is_stripped() {
        let (dir, ctx) = setup();
        assert_eq!(pipeline(&dir).rewrite("$ ls -la", &ctx).command, "ls -la");
    }

    #[test]
    fn python_detection() {
        for src in [
            "print('hi')",
            "import os",
            "from os import path",
            "x = 5",
            "def f(): return 1",
            "[1, 2, 3]",
            "len([1])",
        ] {
            assert!(looks_like_python(src), "{src}");
        }
        for sh in ["echo hi", "x=5", "[ -f a ] && echo y", "[[ -f a ]]", "ls -la", "cd .."] {
            assert!(!looks_like_python(sh), "{sh}");
        }
    }

    #[test]
    fn python_is_wrapped_and_quoted() {
        let (dir, ctx) = setup();
        let rw = pipeline(&dir).rewrite("print('it''s')", &ctx);
        assert_eq!(rw.command, format!("python3 -c {}", shell_quote("print('it''s')")));
    }

    #[test]
    fn editor_creates_file_and_answers_early() {
        let (dir, ctx) = setup();
        let rw = pipeline(&dir).rewrite("nano notes/todo.txt", &ctx);
        assert!(ctx.home.join("notes/todo.txt").is_file());
        match rw.early {
            Some(EarlyResponse::Message { output, exit_code }) => {
                assert_eq!(exit_code, 0);
                assert!(output.starts_with("Created notes/todo.txt"));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn editor_refuses_escaping_paths() {
        let (dir, ctx) = setup();
        let rw = pipeline(&dir).rewrite("vim ../../etc/passwd", &ctx);
        assert_eq!(
            rw.early,
            Some(EarlyResponse::PathTraversal("../../etc/passwd".into()))
        );
    }

    #[test]
    fn builtins_use_helpers_when_present() {
        let (dir, ctx) = setup();
        let p = pipeline(&dir);

        let rw = p.rewrite("install-python", &ctx);
        assert!(matches!(rw.early, Some(EarlyResponse::Message { .. })));

        fs::write(ctx.bin_dir().join("install-python-pip"), "echo ok\n").unwrap();
        let rw = p.rewrite("install-python", &ctx);
        assert_eq!(rw.command, "bash \"$HOME/.local/bin/install-python-pip\"");
        assert!(rw.early.is_none());

        fs::write(ctx.home.join("help.txt"), "help!\n").unwrap();
        assert_eq!(p.rewrite("help", &ctx).command, "cat \"$HOME/help.txt\"");
    }

    #[test]
    fn crypto_wrapper_is_installed_and_clears_interactive() {
        let (dir, ctx) = setup();
        let p = pipeline(&dir);

        let rw = p.rewrite("openssl genrsa 2048", &ctx);
        assert_eq!(rw.command, "openssl genrsa 2048");
        assert!(rw.interactive);
        assert_eq!(rw.notices.len(), 1);

        fs::create_dir_all(dir.path().join("scripts")).unwrap();
        fs::write(dir.path().join("scripts/openssl-wrapper"), "openssl \"$@\"\n").unwrap();
        let rw = p.rewrite("openssl genrsa 2048", &ctx);
        assert_eq!(
            rw.command,
            "/bin/bash \"$HOME/.local/bin/openssl-wrapper\" genrsa 2048"
        );
        assert!(!rw.interactive);
        let mode = fs::metadata(ctx.bin_dir().join("openssl-wrapper"))
            .unwrap()
            .permissions()
            .mode();
        assert_eq!(mode & 0o777, 0o755);
    }

    #[test]
    fn pip_install_goes_to_user_site() {
        let (dir, ctx) = setup();
        let p = pipeline(&dir);
        assert_eq!(p.rewrite("pip install requests", &ctx).command, "pip install --user requests");
        assert_eq!(
            p.rewrite("pip install --user requests", &ctx).command,
            "pip install --user requests"
        );

        fs::write(ctx.bin_dir().join("pip-sandbox"), "").unwrap();
        assert_eq!(
            p.rewrite("pip3 install requests", &ctx).command,
            "bash \"$HOME/.local/bin/pip-sandbox\" install requests"
        );
    }

    #[test]
    fn interactive_tools_are_flagged() {
        let (dir, ctx) = setup();
        let p = pipeline(&dir);
        assert!(p.rewrite("ssh-keygen -t ed25519", &ctx).interactive);
        assert!(p.rewrite("psql", &ctx).interactive);
        assert!(!p.rewrite("sshfs a b", &ctx).interactive);
    }
}
