//! Enforcement via the userland set-management tool.
//!
//! Every flush operation becomes one or more tool invocations of the shape
//! `{tool} {op-flag} -exist {hashed-name} [args…]`. `-exist` makes creation
//! and membership changes idempotent, so exit codes 0 and 1 are
//! success-equivalent; anything above 1 is classified from stderr into the
//! structured backend error taxonomy.

use async_trait::async_trait;
use netpol_dataplane_core::{
    BackendError, SetBackend, SetKind, SetSnapshot, SetType, MANAGED_SET_PREFIX,
};
use std::process::Output;
use tracing::{debug, warn};

const CREATE_FLAG: &str = "-N";
const APPEND_FLAG: &str = "-A";
const DELETE_FLAG: &str = "-D";
const DESTROY_FLAG: &str = "-X";
const LIST_FLAG: &str = "list";
const EXIST_FLAG: &str = "-exist";

const NET_HASH_TYPE: &str = "nethash";
const SET_LIST_TYPE: &str = "setlist";
const IP_PORT_HASH_TYPE: &str = "hash:ip,port";
const MAX_ELEM_FLAG: &str = "maxelem";
const MAX_ELEM_COUNT: &str = "4294967295";

const DEFAULT_TOOL: &str = "ipset";

/// Overrides the tool path, e.g. when the binary lives outside PATH.
pub const TOOL_ENV: &str = "NETPOL_IPSET_TOOL";

/// Runs a set-management command to completion. Broken out from the backend
/// so tests can script the exact invocations and exit codes they expect.
#[async_trait]
pub trait Exec {
    async fn run(&mut self, program: &str, args: &[String]) -> std::io::Result<Output>;
}

/// Runs commands on the host.
#[derive(Copy, Clone, Debug, Default)]
pub struct SystemExec;

#[async_trait]
impl Exec for SystemExec {
    async fn run(&mut self, program: &str, args: &[String]) -> std::io::Result<Output> {
        tokio::process::Command::new(program)
            .args(args)
            .output()
            .await
    }
}

/// The userland-tool enforcement backend.
pub struct CommandBackend<E = SystemExec> {
    exec: E,
    tool: String,
}

/// One tool invocation.
struct SetCommand {
    op: &'static str,
    set: String,
    spec: Vec<String>,
}

// === impl SetCommand ===

impl SetCommand {
    fn new(op: &'static str, set: impl Into<String>) -> Self {
        Self {
            op,
            set: set.into(),
            spec: Vec::new(),
        }
    }

    fn with_spec(op: &'static str, set: impl Into<String>, spec: Vec<String>) -> Self {
        Self {
            op,
            set: set.into(),
            spec,
        }
    }

    fn args(&self) -> Vec<String> {
        let mut args = vec![
            self.op.to_string(),
            EXIST_FLAG.to_string(),
            self.set.clone(),
        ];
        args.extend(self.spec.iter().cloned());
        args
    }
}

// === impl CommandBackend ===

impl CommandBackend<SystemExec> {
    pub fn new() -> Self {
        Self::with_exec(SystemExec)
    }
}

impl Default for CommandBackend<SystemExec> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E: Exec + Send> CommandBackend<E> {
    pub fn with_exec(exec: E) -> Self {
        let tool = std::env::var(TOOL_ENV).unwrap_or_else(|_| DEFAULT_TOOL.to_string());
        Self { exec, tool }
    }

    /// Runs one command, returning its exit code and stdout. With `-exist`
    /// present, exit codes 0 and 1 are success-equivalent; greater codes are
    /// classified from stderr.
    async fn run(&mut self, cmd: &SetCommand) -> Result<(i32, String), BackendError> {
        let args = cmd.args();
        debug!(tool = %self.tool, ?args, "Running set command");
        let out = self
            .exec
            .run(&self.tool, &args)
            .await
            .map_err(BackendError::unavailable)?;
        let code = out.status.code().unwrap_or(-1);
        if (0..=1).contains(&code) {
            return Ok((code, String::from_utf8_lossy(&out.stdout).into_owned()));
        }
        let stderr = String::from_utf8_lossy(&out.stderr).into_owned();
        Err(classify(&cmd.set, code, &stderr))
    }

    async fn run_raw(&mut self, args: &[String]) -> Result<String, BackendError> {
        debug!(tool = %self.tool, ?args, "Running set command");
        let out = self
            .exec
            .run(&self.tool, args)
            .await
            .map_err(BackendError::unavailable)?;
        let code = out.status.code().unwrap_or(-1);
        if code > 1 {
            let stderr = String::from_utf8_lossy(&out.stderr).into_owned();
            return Err(BackendError::Failed { code, stderr });
        }
        Ok(String::from_utf8_lossy(&out.stdout).into_owned())
    }

    /// Creates the set if absent, with the type flags its origin requires.
    async fn create(&mut self, set: &SetSnapshot) -> Result<(), BackendError> {
        let spec = match (set.kind(), set.set_type) {
            (SetKind::List, _) => vec![SET_LIST_TYPE.to_string()],
            (SetKind::Hash, SetType::NamedPorts) => vec![IP_PORT_HASH_TYPE.to_string()],
            // CIDR sets can grow with every policy revision; raise the
            // element cap from the tool's conservative default.
            (SetKind::Hash, SetType::CidrBlocks) => vec![
                NET_HASH_TYPE.to_string(),
                MAX_ELEM_FLAG.to_string(),
                MAX_ELEM_COUNT.to_string(),
            ],
            (SetKind::Hash, _) => vec![NET_HASH_TYPE.to_string()],
        };
        self.run(&SetCommand::with_spec(CREATE_FLAG, &set.hashed_name, spec))
            .await?;
        Ok(())
    }

    /// Reads the set's current host membership.
    async fn members(&mut self, hashed_name: &str) -> Result<Vec<String>, BackendError> {
        let (_, stdout) = self.run(&SetCommand::new(LIST_FLAG, hashed_name)).await?;
        Ok(parse_members(&stdout))
    }

    /// Destroys every set on the host that carries the managed prefix.
    async fn destroy_managed_sets(&mut self) -> Result<(), BackendError> {
        let listing = self.run_raw(&[LIST_FLAG.to_string()]).await?;
        for name in parse_set_names(&listing) {
            if !name.starts_with(MANAGED_SET_PREFIX) {
                continue;
            }
            warn!(set = %name, "Destroying stale managed set");
            self.destroy(&name).await?;
        }
        Ok(())
    }

    async fn destroy(&mut self, hashed_name: &str) -> Result<(), BackendError> {
        match self.run(&SetCommand::new(DESTROY_FLAG, hashed_name)).await {
            Ok(_) => Ok(()),
            // Destroying a set that is already gone is a success.
            Err(BackendError::DoesNotExist(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }
}

#[async_trait]
impl<E: Exec + Send> SetBackend for CommandBackend<E> {
    async fn initialize(&mut self) -> Result<(), BackendError> {
        self.destroy_managed_sets().await
    }

    async fn ensure_set(&mut self, set: &SetSnapshot) -> Result<(), BackendError> {
        self.create(set).await?;

        let current = self.members(&set.hashed_name).await?;
        for member in &set.contents {
            if !current.contains(member) {
                self.run(&SetCommand::with_spec(
                    APPEND_FLAG,
                    &set.hashed_name,
                    vec![member.clone()],
                ))
                .await?;
            }
        }
        for member in &current {
            if !set.contents.contains(member) {
                self.run(&SetCommand::with_spec(
                    DELETE_FLAG,
                    &set.hashed_name,
                    vec![member.clone()],
                ))
                .await?;
            }
        }
        Ok(())
    }

    async fn destroy_set(&mut self, hashed_name: &str) -> Result<(), BackendError> {
        self.destroy(hashed_name).await
    }

    async fn reset(&mut self) -> Result<(), BackendError> {
        self.destroy_managed_sets().await
    }
}

/// Maps a failing invocation's stderr onto the structured taxonomy. The
/// substrings are the tool's own diagnostics, stable across the versions this
/// controller supports.
fn classify(set: &str, code: i32, stderr: &str) -> BackendError {
    let set = set.to_string();
    if stderr.contains("it is in use by a kernel component") {
        BackendError::SetInUseByKernel(set)
    } else if stderr.contains("The set with the given name does not exist") {
        BackendError::DoesNotExist(set)
    } else if stderr.contains("set with the same name already exists") {
        BackendError::AlreadyExists(set)
    } else if stderr.contains("Syntax error: Elem separator") {
        BackendError::ElemSeparatorUnsupported(set)
    } else if stderr.contains("Second element is missing") {
        BackendError::SecondElementMissing(set)
    } else if stderr.contains("Missing second mandatory argument") {
        BackendError::MissingSecondMandatoryArgument(set)
    } else if stderr.contains("Set to be added/deleted/tested as element does not exist") {
        BackendError::ElementDoesNotExist(set)
    } else {
        BackendError::Failed {
            code,
            stderr: stderr.to_string(),
        }
    }
}

/// Pulls the member lines out of a `list` invocation's stanza output.
fn parse_members(stdout: &str) -> Vec<String> {
    stdout
        .lines()
        .skip_while(|line| line.trim() != "Members:")
        .skip(1)
        .map_while(|line| {
            let line = line.trim();
            if line.is_empty() {
                None
            } else {
                Some(line.to_string())
            }
        })
        .collect()
}

/// Pulls every set name out of a bare `list` invocation.
fn parse_set_names(stdout: &str) -> Vec<String> {
    stdout
        .lines()
        .filter_map(|line| line.strip_prefix("Name:"))
        .map(|name| name.trim().to_string())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use netpol_dataplane_core::hashed_name;
    use std::collections::VecDeque;
    use std::os::unix::process::ExitStatusExt;
    use std::process::ExitStatus;
    use std::sync::{Arc, Mutex};

    /// Scripts the invocations a test expects, in order, each with its
    /// stdout and exit code.
    #[derive(Clone, Debug, Default)]
    struct ScriptedExec {
        calls: Arc<Mutex<VecDeque<ScriptedCall>>>,
    }

    #[derive(Clone, Debug)]
    struct ScriptedCall {
        args: Vec<String>,
        stdout: String,
        stderr: String,
        code: i32,
    }

    impl ScriptedExec {
        fn expect(&self, args: &[&str]) -> &Self {
            self.expect_with(args, "", "", 0)
        }

        fn expect_with(&self, args: &[&str], stdout: &str, stderr: &str, code: i32) -> &Self {
            self.calls.lock().unwrap().push_back(ScriptedCall {
                args: args.iter().map(|s| s.to_string()).collect(),
                stdout: stdout.to_string(),
                stderr: stderr.to_string(),
                code,
            });
            self
        }

        fn verify(&self) {
            let remaining = self.calls.lock().unwrap();
            assert!(
                remaining.is_empty(),
                "expected {} more invocations: {:?}",
                remaining.len(),
                remaining
            );
        }
    }

    #[async_trait]
    impl Exec for ScriptedExec {
        async fn run(&mut self, program: &str, args: &[String]) -> std::io::Result<Output> {
            assert_eq!(program, "ipset");
            let call = self
                .calls
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| panic!("unexpected invocation: {:?}", args));
            assert_eq!(args, call.args.as_slice());
            Ok(Output {
                status: ExitStatus::from_raw((call.code & 0xff) << 8),
                stdout: call.stdout.into_bytes(),
                stderr: call.stderr.into_bytes(),
            })
        }
    }

    fn backend(exec: ScriptedExec) -> CommandBackend<ScriptedExec> {
        CommandBackend {
            exec,
            tool: "ipset".to_string(),
        }
    }

    fn snapshot(name: &str, set_type: SetType, contents: &[&str]) -> SetSnapshot {
        SetSnapshot {
            name: name.to_string(),
            hashed_name: hashed_name(name),
            set_type,
            contents: contents.iter().map(|s| s.to_string()).collect(),
        }
    }

    #[tokio::test]
    async fn ensure_creates_and_appends_missing_members() {
        let set = snapshot("podsel", SetType::KeyLabelOfPod, &["10.0.0.1"]);
        let hashed = set.hashed_name.clone();

        let exec = ScriptedExec::default();
        exec.expect(&["-N", "-exist", &hashed, "nethash"])
            .expect_with(
                &["list", "-exist", &hashed],
                "Name: x\nType: hash:net\nMembers:\n",
                "",
                0,
            )
            .expect(&["-A", "-exist", &hashed, "10.0.0.1"]);

        let mut b = backend(exec.clone());
        b.ensure_set(&set).await.unwrap();
        exec.verify();
    }

    #[tokio::test]
    async fn ensure_reconciles_away_extra_members() {
        let set = snapshot("podsel", SetType::KeyLabelOfPod, &["10.0.0.1"]);
        let hashed = set.hashed_name.clone();

        let exec = ScriptedExec::default();
        exec.expect(&["-N", "-exist", &hashed, "nethash"])
            .expect_with(
                &["list", "-exist", &hashed],
                "Name: x\nMembers:\n10.0.0.1\n10.0.0.9\n",
                "",
                0,
            )
            .expect(&["-D", "-exist", &hashed, "10.0.0.9"]);

        let mut b = backend(exec.clone());
        b.ensure_set(&set).await.unwrap();
        exec.verify();
    }

    #[tokio::test]
    async fn list_sets_are_created_as_setlists() {
        let member_hashed = hashed_name("ns-a");
        let set = SetSnapshot {
            name: "labels".to_string(),
            hashed_name: hashed_name("labels"),
            set_type: SetType::KeyLabelOfNamespace,
            contents: vec![member_hashed.clone()],
        };
        let hashed = set.hashed_name.clone();

        let exec = ScriptedExec::default();
        exec.expect(&["-N", "-exist", &hashed, "setlist"])
            .expect_with(&["list", "-exist", &hashed], "Members:\n", "", 0)
            .expect(&["-A", "-exist", &hashed, &member_hashed]);

        let mut b = backend(exec.clone());
        b.ensure_set(&set).await.unwrap();
        exec.verify();
    }

    #[tokio::test]
    async fn port_and_cidr_sets_get_their_type_flags() {
        let ports = snapshot("named-ports", SetType::NamedPorts, &[]);
        let cidrs = snapshot("blocks", SetType::CidrBlocks, &[]);

        let exec = ScriptedExec::default();
        exec.expect(&["-N", "-exist", &ports.hashed_name, "hash:ip,port"])
            .expect_with(&["list", "-exist", &ports.hashed_name], "Members:\n", "", 0)
            .expect(&[
                "-N",
                "-exist",
                &cidrs.hashed_name,
                "nethash",
                "maxelem",
                "4294967295",
            ])
            .expect_with(&["list", "-exist", &cidrs.hashed_name], "Members:\n", "", 0);

        let mut b = backend(exec.clone());
        b.ensure_set(&ports).await.unwrap();
        b.ensure_set(&cidrs).await.unwrap();
        exec.verify();
    }

    #[tokio::test]
    async fn exit_code_one_is_success_with_exist() {
        let set = snapshot("podsel", SetType::KeyLabelOfPod, &[]);
        let hashed = set.hashed_name.clone();

        let exec = ScriptedExec::default();
        exec.expect_with(&["-N", "-exist", &hashed, "nethash"], "", "", 1)
            .expect_with(&["list", "-exist", &hashed], "Members:\n", "", 0);

        let mut b = backend(exec.clone());
        b.ensure_set(&set).await.unwrap();
        exec.verify();
    }

    #[tokio::test]
    async fn destroy_succeeds_when_the_set_is_gone() {
        let hashed = hashed_name("gone");

        let exec = ScriptedExec::default();
        exec.expect_with(
            &["-X", "-exist", &hashed],
            "",
            "ipset v7.15: The set with the given name does not exist",
            2,
        );

        let mut b = backend(exec.clone());
        b.destroy_set(&hashed).await.unwrap();
        exec.verify();
    }

    #[tokio::test]
    async fn initialize_destroys_stale_managed_sets() {
        let stale = format!("{}deadbeef", MANAGED_SET_PREFIX);
        let listing = format!(
            "Name: {}\nType: hash:net\nMembers:\n10.0.0.1\n\nName: unrelated\nMembers:\n",
            stale
        );

        let exec = ScriptedExec::default();
        exec.expect_with(&["list"], &listing, "", 0)
            .expect(&["-X", "-exist", &stale]);

        let mut b = backend(exec.clone());
        b.initialize().await.unwrap();
        exec.verify();
    }

    #[tokio::test]
    async fn stderr_is_classified() {
        let cases = [
            (
                "Set cannot be destroyed: it is in use by a kernel component",
                BackendError::SetInUseByKernel("s".to_string()),
            ),
            (
                "The set with the given name does not exist",
                BackendError::DoesNotExist("s".to_string()),
            ),
            (
                "Set cannot be created: set with the same name already exists",
                BackendError::AlreadyExists("s".to_string()),
            ),
            (
                "Syntax error: Elem separator expected",
                BackendError::ElemSeparatorUnsupported("s".to_string()),
            ),
            (
                "Second element is missing from 10.0.0.1",
                BackendError::SecondElementMissing("s".to_string()),
            ),
            (
                "Missing second mandatory argument to command add",
                BackendError::MissingSecondMandatoryArgument("s".to_string()),
            ),
            (
                "Set to be added/deleted/tested as element does not exist",
                BackendError::ElementDoesNotExist("s".to_string()),
            ),
        ];
        for (stderr, expected) in cases {
            assert_eq!(classify("s", 2, stderr), expected, "{}", stderr);
        }

        assert_eq!(
            classify("s", 3, "something new"),
            BackendError::Failed {
                code: 3,
                stderr: "something new".to_string(),
            }
        );
    }

    #[tokio::test]
    async fn spawn_failures_are_transient() {
        struct FailingExec;

        #[async_trait]
        impl Exec for FailingExec {
            async fn run(&mut self, _: &str, _: &[String]) -> std::io::Result<Output> {
                Err(std::io::Error::from(std::io::ErrorKind::NotFound))
            }
        }

        let mut b = CommandBackend {
            exec: FailingExec,
            tool: "ipset".to_string(),
        };
        let err = b
            .destroy_set(&hashed_name("x"))
            .await
            .expect_err("spawn should fail");
        assert!(err.is_transient());
    }

    #[test]
    fn member_stanza_parsing() {
        let out = "Name: netpol-abc\nType: hash:net\nHeader: family inet\nMembers:\n10.0.0.1\n10.0.0.2,tcp,8080\n";
        assert_eq!(parse_members(out), vec!["10.0.0.1", "10.0.0.2,tcp,8080"]);
        assert_eq!(parse_members("Name: x\nMembers:\n"), Vec::<String>::new());
        assert_eq!(parse_members("no members header"), Vec::<String>::new());
    }
}
