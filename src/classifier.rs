//! Decides whether a one-shot command line needs a real terminal device, and
//! rewrites the ones that have a non-interactive equivalent.
//!
//! The policy is a static table keyed by program name. A command line is
//! split into pipeline/list segments (`|`, `;`, `&&`, `||`, `&`); each segment
//! is classified on its own and the line needs a pty when any segment does.
//! Text typed into a persistent terminal never goes through here.

use std::collections::{HashMap, HashSet};
use std::sync::LazyLock;

/// When a program needs a pty, and what it can be rewritten into.
#[derive(Debug, Clone, Copy)]
pub struct CommandPolicy {
    pub name: &'static str,
    /// Flags that put the program in a non-interactive mode.
    pub batch_flags: &'static [&'static str],
    /// Number of positional arguments at which the program stops being
    /// interactive (`python script.py`, `less file`). `None` means never.
    pub min_args: Option<usize>,
    pub rewrite: Rewrite,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rewrite {
    None,
    /// Append flags unless a batch flag is already present.
    AppendFlags(&'static str),
    /// Replace the whole invocation (arguments are dropped).
    Replace(&'static str),
    /// Pager with file arguments becomes a plain dump of those files.
    DumpFiles,
    /// `watch [opts] cmd...` runs `cmd...` once.
    InnerCommand,
    /// Prefix the invocation with an environment assignment.
    Prefix(&'static str),
}

impl CommandPolicy {
    const fn always(name: &'static str) -> Self {
        Self { name, batch_flags: &[], min_args: None, rewrite: Rewrite::None }
    }

    const fn unless_args(name: &'static str, min_args: usize) -> Self {
        Self { name, batch_flags: &[], min_args: Some(min_args), rewrite: Rewrite::None }
    }

    const fn unless_flags(name: &'static str, batch_flags: &'static [&'static str]) -> Self {
        Self { name, batch_flags, min_args: None, rewrite: Rewrite::None }
    }

    const fn with_rewrite(mut self, rewrite: Rewrite) -> Self {
        self.rewrite = rewrite;
        self
    }

    const fn with_min_args(mut self, min_args: usize) -> Self {
        self.min_args = Some(min_args);
        self
    }
}

const SHELL_FLAGS: &[&str] = &["-c"];
const PYTHON_FLAGS: &[&str] = &["-c", "-m"];
const NODE_FLAGS: &[&str] = &["-e", "--eval", "-p", "--print"];
const MYSQL_FLAGS: &[&str] = &["-e", "--execute"];
const PSQL_FLAGS: &[&str] = &["-c", "--command", "-f", "--file", "-l", "--list"];
const MONGO_FLAGS: &[&str] = &["--eval"];
const TOP_FLAGS: &[&str] = &["-b", "--batch", "-l"];

/// The built-in policy table.
pub const STANDARD_POLICIES: &[CommandPolicy] = &[
    // Full-screen editors
    CommandPolicy::always("vi"),
    CommandPolicy::always("vim"),
    CommandPolicy::always("nvim"),
    CommandPolicy::always("nano"),
    CommandPolicy::always("pico"),
    CommandPolicy::always("emacs"),
    CommandPolicy::always("micro"),
    CommandPolicy::always("joe"),
    // Pagers: interactive only when paging stdin
    CommandPolicy::unless_args("less", 1).with_rewrite(Rewrite::DumpFiles),
    CommandPolicy::unless_args("more", 1).with_rewrite(Rewrite::DumpFiles),
    CommandPolicy::unless_args("most", 1).with_rewrite(Rewrite::DumpFiles),
    CommandPolicy::always("man").with_rewrite(Rewrite::Prefix("MANPAGER=cat")),
    // Live monitors
    CommandPolicy::unless_flags("top", TOP_FLAGS).with_rewrite(Rewrite::AppendFlags("-b -n 1")),
    CommandPolicy::always("htop").with_rewrite(Rewrite::Replace("top -b -n 1")),
    CommandPolicy::always("btop").with_rewrite(Rewrite::Replace("top -b -n 1")),
    CommandPolicy::always("watch").with_rewrite(Rewrite::InnerCommand),
    // Database shells
    CommandPolicy::unless_flags("mysql", MYSQL_FLAGS),
    CommandPolicy::unless_flags("mariadb", MYSQL_FLAGS),
    CommandPolicy::unless_flags("psql", PSQL_FLAGS),
    CommandPolicy::unless_args("sqlite3", 2),
    CommandPolicy::unless_flags("mongo", MONGO_FLAGS),
    CommandPolicy::unless_flags("mongosh", MONGO_FLAGS),
    CommandPolicy::unless_args("redis-cli", 1),
    // REPLs
    CommandPolicy::unless_flags("python", PYTHON_FLAGS).with_min_args(1),
    CommandPolicy::unless_flags("python3", PYTHON_FLAGS).with_min_args(1),
    CommandPolicy::unless_flags("ipython", PYTHON_FLAGS).with_min_args(1),
    CommandPolicy::unless_flags("node", NODE_FLAGS).with_min_args(1),
    CommandPolicy::unless_args("irb", 1),
    CommandPolicy::unless_args("ghci", 1),
    CommandPolicy::unless_args("lua", 1),
    CommandPolicy::unless_args("bc", 1),
    CommandPolicy::unless_flags("bash", SHELL_FLAGS).with_min_args(1),
    CommandPolicy::unless_flags("sh", SHELL_FLAGS).with_min_args(1),
    CommandPolicy::unless_flags("zsh", SHELL_FLAGS).with_min_args(1),
    CommandPolicy::unless_flags("fish", SHELL_FLAGS).with_min_args(1),
    // Remote login
    CommandPolicy::unless_args("ssh", 2),
    CommandPolicy::always("telnet"),
    CommandPolicy::always("ftp"),
    CommandPolicy::always("sftp"),
    CommandPolicy::always("mosh"),
];

/// Programs whose `-i` means something other than "interactive".
const PLAIN_SHORT_I: &[&str] = &[
    "grep", "egrep", "fgrep", "rg", "ag", "sed", "sort", "uniq", "diff", "cut", "jq", "curl",
    "wget", "ls", "tr", "xargs",
];

/// Words that run the next word as the actual program.
const WRAPPERS: &[&str] = &["sudo", "exec", "nohup", "time", "env", "command"];

/// Result of classifying one command line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Classification {
    pub needs_pty: bool,
    /// The line after rewrites; equal to the input when nothing applied.
    pub rewritten: String,
}

impl Classification {
    pub fn was_rewritten(&self, original: &str) -> bool {
        self.rewritten != original.trim()
    }
}

pub struct CommandClassifier {
    policies: HashMap<&'static str, CommandPolicy>,
    plain_short_i: HashSet<&'static str>,
}

static STANDARD: LazyLock<CommandClassifier> =
    LazyLock::new(|| CommandClassifier::new(STANDARD_POLICIES));

/// Classify with the built-in table.
pub fn needs_pty(command_line: &str) -> bool {
    CommandClassifier::standard().needs_pty(command_line)
}

/// Rewrite with the built-in table.
pub fn rewrite_for_non_interactive(command_line: &str) -> String {
    CommandClassifier::standard().rewrite_for_non_interactive(command_line)
}

impl CommandClassifier {
    pub fn new(policies: &[CommandPolicy]) -> Self {
        Self {
            policies: policies.iter().map(|p| (p.name, *p)).collect(),
            plain_short_i: PLAIN_SHORT_I.iter().copied().collect(),
        }
    }

    pub fn standard() -> &'static CommandClassifier {
        &STANDARD
    }

    pub fn classify(&self, command_line: &str) -> Classification {
        let segments = split_segments(command_line);
        let mut needs_pty = false;
        let mut changed = false;
        let mut rewritten = String::new();
        for segment in &segments {
            let invocation = Invocation::parse(&segment.text);
            needs_pty |= self.segment_needs_pty(&invocation);
            let body = self.rewrite_segment(&invocation, &segment.text);
            changed |= body != segment.text.trim();
            rewritten.push_str(&body);
            if let Some(sep) = segment.separator {
                rewritten.push(' ');
                rewritten.push_str(sep);
                rewritten.push(' ');
            }
        }
        // Lines no rule touched are handed back byte for byte.
        let rewritten = if changed {
            rewritten.trim().to_string()
        } else {
            command_line.trim().to_string()
        };
        Classification { needs_pty, rewritten }
    }

    pub fn needs_pty(&self, command_line: &str) -> bool {
        split_segments(command_line)
            .iter()
            .any(|segment| self.segment_needs_pty(&Invocation::parse(&segment.text)))
    }

    pub fn rewrite_for_non_interactive(&self, command_line: &str) -> String {
        self.classify(command_line).rewritten
    }

    fn segment_needs_pty(&self, inv: &Invocation) -> bool {
        let Some(program) = inv.program() else {
            return false;
        };

        if let Some(policy) = self.policies.get(program.as_str()) {
            if inv.has_any_flag(policy.batch_flags) {
                return false;
            }
            return match policy.min_args {
                Some(n) => inv.positional().len() < n,
                None => true,
            };
        }

        if inv.has_flag("--interactive") {
            return true;
        }
        inv.has_short_flag('i') && !self.plain_short_i.contains(program.as_str())
    }

    fn rewrite_segment(&self, inv: &Invocation, original: &str) -> String {
        let Some(program) = inv.program() else {
            return original.trim().to_string();
        };
        let Some(policy) = self.policies.get(program.as_str()) else {
            return original.trim().to_string();
        };

        let body = match policy.rewrite {
            Rewrite::None => None,
            Rewrite::AppendFlags(flags) => {
                if inv.has_any_flag(policy.batch_flags) {
                    None
                } else {
                    Some(join(inv.command_words().iter().map(String::as_str).chain([flags])))
                }
            }
            Rewrite::Replace(replacement) => Some(replacement.to_string()),
            Rewrite::DumpFiles => {
                let files = inv.positional();
                if files.is_empty() {
                    None
                } else {
                    Some(join(std::iter::once(dump_program()).chain(files.iter().map(String::as_str))))
                }
            }
            Rewrite::InnerCommand => {
                let inner = watch_inner_command(&inv.args);
                if inner.is_empty() {
                    None
                } else {
                    Some(join(inner.iter().map(String::as_str)))
                }
            }
            Rewrite::Prefix(assignment) => Some(join(
                std::iter::once(assignment).chain(inv.command_words().iter().map(String::as_str)),
            )),
        };

        match body {
            Some(body) if inv.prefix.is_empty() => body,
            Some(body) => format!("{} {}", join(inv.prefix.iter().map(String::as_str)), body),
            None => original.trim().to_string(),
        }
    }
}

fn dump_program() -> &'static str {
    if cfg!(windows) {
        "type"
    } else {
        "cat"
    }
}

fn join<'a>(words: impl Iterator<Item = &'a str>) -> String {
    words.collect::<Vec<_>>().join(" ")
}

/// Skip watch's own options and return the command it would repeat.
fn watch_inner_command(args: &[String]) -> Vec<String> {
    const TAKES_VALUE: &[&str] = &["-n", "--interval", "-q", "--equexit"];
    let mut iter = args.iter().peekable();
    while let Some(arg) = iter.next_if(|a| a.starts_with('-')) {
        if TAKES_VALUE.contains(&arg.as_str()) {
            iter.next();
        }
    }
    iter.cloned().collect()
}

/// One simple command: leading env assignments/wrappers, program, arguments.
#[derive(Debug)]
struct Invocation {
    prefix: Vec<String>,
    program: Option<String>,
    args: Vec<String>,
}

impl Invocation {
    fn parse(segment: &str) -> Self {
        let words = split_words(segment);
        let mut prefix = Vec::new();
        let mut iter = words.into_iter();
        let mut program = None;
        for word in iter.by_ref() {
            let bare = unquote(&word);
            let is_assignment = bare
                .split_once('=')
                .is_some_and(|(name, _)| !name.is_empty() && name.chars().all(|c| c.is_alphanumeric() || c == '_'));
            if is_assignment || WRAPPERS.contains(&bare.as_str()) || (bare.starts_with('-') && !prefix.is_empty()) {
                prefix.push(word);
                continue;
            }
            program = Some(word);
            break;
        }
        Self { prefix, program, args: iter.collect() }
    }

    /// Program basename without quotes, directory, or `.exe`.
    fn program(&self) -> Option<String> {
        let raw = unquote(self.program.as_ref()?);
        let base = raw
            .rsplit(['/', '\\'])
            .next()
            .unwrap_or(raw.as_str())
            .to_ascii_lowercase();
        Some(base.strip_suffix(".exe").map(str::to_string).unwrap_or(base))
    }

    fn command_words(&self) -> Vec<String> {
        self.program.iter().chain(self.args.iter()).cloned().collect()
    }

    fn positional(&self) -> Vec<String> {
        self.args.iter().filter(|a| !a.starts_with('-')).cloned().collect()
    }

    fn has_flag(&self, flag: &str) -> bool {
        self.args
            .iter()
            .any(|a| a == flag || a.split_once('=').is_some_and(|(name, _)| name == flag))
    }

    fn has_any_flag(&self, flags: &[&str]) -> bool {
        flags.iter().any(|f| self.has_flag(f))
    }

    /// Matches `-i` on its own or inside a cluster such as `-it`.
    fn has_short_flag(&self, flag: char) -> bool {
        self.args.iter().any(|a| {
            a.starts_with('-')
                && !a.starts_with("--")
                && a.len() > 1
                && a[1..].chars().all(|c| c.is_ascii_alphabetic())
                && a[1..].contains(flag)
        })
    }
}

#[derive(Debug)]
struct Segment {
    text: String,
    separator: Option<&'static str>,
}

/// Split on unquoted `|`, `||`, `&&`, `&`, `;`. An `&` inside a redirection
/// does not split.
fn split_segments(line: &str) -> Vec<Segment> {
    let mut segments = Vec::new();
    let mut current = String::new();
    let mut quote: Option<char> = None;
    let mut chars = line.chars().peekable();

    while let Some(c) = chars.next() {
        if let Some(q) = quote {
            current.push(c);
            if c == q {
                quote = None;
            } else if c == '\\' && q == '"' {
                if let Some(next) = chars.next() {
                    current.push(next);
                }
            }
            continue;
        }
        let separator = match c {
            '\'' | '"' => {
                quote = Some(c);
                current.push(c);
                continue;
            }
            '\\' => {
                current.push(c);
                if let Some(next) = chars.next() {
                    current.push(next);
                }
                continue;
            }
            '|' if chars.peek() == Some(&'|') => {
                chars.next();
                "||"
            }
            '|' => "|",
            // Part of a redirection: `2>&1`, `<&3`, `&>file`.
            '&' if current.ends_with(['>', '<']) || chars.peek() == Some(&'>') => {
                current.push(c);
                continue;
            }
            '&' if chars.peek() == Some(&'&') => {
                chars.next();
                "&&"
            }
            '&' => "&",
            ';' => ";",
            _ => {
                current.push(c);
                continue;
            }
        };
        segments.push(Segment { text: std::mem::take(&mut current), separator: Some(separator) });
    }
    segments.push(Segment { text: current, separator: None });
    segments
}

/// Split on unquoted whitespace, keeping quotes in the words.
fn split_words(segment: &str) -> Vec<String> {
    let mut words = Vec::new();
    let mut current = String::new();
    let mut quote: Option<char> = None;
    for c in segment.chars() {
        match quote {
            Some(q) => {
                current.push(c);
                if c == q {
                    quote = None;
                }
            }
            None if c == '\'' || c == '"' => {
                quote = Some(c);
                current.push(c);
            }
            None if c.is_whitespace() => {
                if !current.is_empty() {
                    words.push(std::mem::take(&mut current));
                }
            }
            None => current.push(c),
        }
    }
    if !current.is_empty() {
        words.push(current);
    }
    words
}

fn unquote(word: &str) -> String {
    word.chars().filter(|c| *c != '\'' && *c != '"').collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn editors_need_pty() {
        assert!(needs_pty("vim notes.txt"));
        assert!(needs_pty("nano"));
        assert!(needs_pty("/usr/bin/emacs -nw"));
    }

    #[test]
    fn plain_commands_do_not() {
        assert!(!needs_pty("ls -la"));
        assert!(!needs_pty("echo hello"));
        assert!(!needs_pty("cargo build --release"));
        assert!(!needs_pty(""));
    }

    #[test]
    fn top_needs_pty_and_rewrites_to_batch() {
        assert!(needs_pty("top"));
        assert_eq!(rewrite_for_non_interactive("top"), "top -b -n 1");
    }

    #[test]
    fn top_in_batch_mode_is_left_alone() {
        assert!(!needs_pty("top -b -n 1"));
        assert_eq!(rewrite_for_non_interactive("top -b -n 1"), "top -b -n 1");
    }

    #[test]
    fn htop_becomes_top_batch() {
        assert!(needs_pty("htop"));
        assert_eq!(rewrite_for_non_interactive("htop -d 10"), "top -b -n 1");
    }

    #[test]
    fn pager_with_files_dumps_them() {
        assert!(!needs_pty("less README.md"));
        assert!(!needs_pty("more -d a.txt b.txt"));
        assert_eq!(rewrite_for_non_interactive("less README.md"), format!("{} README.md", dump_program()));
        assert_eq!(
            rewrite_for_non_interactive("more -d a.txt b.txt"),
            format!("{} a.txt b.txt", dump_program())
        );
    }

    #[test]
    fn bare_pager_keeps_requiring_pty() {
        assert!(needs_pty("less"));
        assert_eq!(rewrite_for_non_interactive("less"), "less");
        assert!(needs_pty("cat big.log | less"));
        assert_eq!(rewrite_for_non_interactive("cat big.log | less"), "cat big.log | less");
    }

    #[test]
    fn repl_only_without_script() {
        assert!(needs_pty("python3"));
        assert!(!needs_pty("python3 script.py"));
        assert!(!needs_pty("python -c 'print(1)'"));
        assert!(needs_pty("node"));
        assert!(!needs_pty("node -e 'console.log(1)'"));
    }

    #[test]
    fn database_shells_respect_batch_flags() {
        assert!(needs_pty("mysql -u root"));
        assert!(!needs_pty("mysql -u root -e 'select 1'"));
        assert!(needs_pty("psql mydb"));
        assert!(!needs_pty("psql mydb -c 'select 1'"));
        assert!(!needs_pty("psql mydb --command=select"));
        assert!(needs_pty("sqlite3 app.db"));
        assert!(!needs_pty("sqlite3 app.db 'select 1'"));
    }

    #[test]
    fn remote_login() {
        assert!(needs_pty("ssh host"));
        assert!(!needs_pty("ssh host uptime"));
        assert!(needs_pty("telnet example.com 23"));
    }

    #[test]
    fn interactive_flags_mark_unknown_programs() {
        assert!(needs_pty("rm -i file"));
        assert!(needs_pty("docker run -it ubuntu"));
        assert!(needs_pty("mytool --interactive"));
        assert!(!needs_pty("grep -i pattern file"));
        assert!(!needs_pty("sed -i s/a/b/ file"));
    }

    #[test]
    fn wrappers_and_env_assignments_are_skipped() {
        assert!(needs_pty("sudo vim /etc/hosts"));
        assert!(needs_pty("TERM=xterm top"));
        assert_eq!(rewrite_for_non_interactive("sudo top"), "sudo top -b -n 1");
    }

    #[test]
    fn watch_runs_inner_command_once() {
        assert!(needs_pty("watch -n 2 ls -l"));
        assert_eq!(rewrite_for_non_interactive("watch -n 2 ls -l"), "ls -l");
        assert_eq!(rewrite_for_non_interactive("watch df -h"), "df -h");
    }

    #[test]
    fn man_gets_a_non_paging_pager() {
        assert!(needs_pty("man ls"));
        assert_eq!(rewrite_for_non_interactive("man ls"), "MANPAGER=cat man ls");
    }

    #[test]
    fn quoted_separators_do_not_split() {
        assert!(!needs_pty("echo 'vim | less'"));
        assert_eq!(rewrite_for_non_interactive("echo \"top; htop\""), "echo \"top; htop\"");
    }

    #[test]
    fn fd_redirections_are_not_separators() {
        for line in ["echo hi 2>&1", "echo hi 1>&2", "echo hi >&2", "make &>build.log", "cat <&3"] {
            let c = CommandClassifier::standard().classify(line);
            assert!(!c.needs_pty, "{line}");
            assert_eq!(c.rewritten, line);
            assert!(!c.was_rewritten(line));
        }
        assert!(needs_pty("top 2>&1"));
        assert_eq!(rewrite_for_non_interactive("top 2>&1"), "top 2>&1 -b -n 1");
    }

    #[test]
    fn untouched_lines_keep_their_spacing() {
        let line = "sleep 5 &  echo  started;ls";
        assert_eq!(rewrite_for_non_interactive(line), line);
        assert_eq!(rewrite_for_non_interactive("  uptime  "), "uptime");
    }

    #[test]
    fn every_segment_is_rewritten() {
        assert_eq!(
            rewrite_for_non_interactive("uptime && top"),
            "uptime && top -b -n 1"
        );
        let c = CommandClassifier::standard().classify("uptime && top");
        assert!(c.needs_pty);
        assert!(c.was_rewritten("uptime && top"));
    }

    #[test]
    fn custom_table_is_honoured() {
        let classifier = CommandClassifier::new(&[CommandPolicy::always("mytui")]);
        assert!(classifier.needs_pty("mytui --fast"));
        assert!(!classifier.needs_pty("vim"));
    }
}
