//! In-memory doubles for the runtime, command executor and filesystem.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::cluster::{Node, NodeConnector};
use crate::remote::{CommandExecutor, CommandOutput, FileReader};
use crate::runtime::{
    ContainerID, ContainerInfo, ContainerRuntime, ContainerSpec, RuntimeError, qualified_name,
};

const FIRST_HOST_PORT: usize = 49153;

/// One call that reached a fake node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Call {
    pub node: String,
    pub op: &'static str,
    pub target: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FakeContainer {
    pub node: String,
    pub spec: ContainerSpec,
    pub ip: String,
    pub running: bool,
    pub started: bool,
    pub ports: HashMap<String, String>,
}

#[derive(Default)]
struct FakeState {
    images: HashSet<String>,
    containers: HashMap<ContainerID, FakeContainer>,
    calls: Vec<Call>,
    created: usize,
    exit_code: i64,
    unmapped_ports: bool,
    dies_on_start: bool,
    failing_nodes: HashSet<String>,
}

/// Runtime double. Clones share state; each connected node sees only the
/// containers created on it, while images are shared across nodes.
#[derive(Clone, Default)]
pub struct FakeRuntime {
    node: String,
    state: Arc<Mutex<FakeState>>,
}

impl FakeRuntime {
    fn state(&self) -> MutexGuard<'_, FakeState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn record(&self, state: &mut FakeState, op: &'static str, target: &str) {
        state.calls.push(Call {
            node: self.node.clone(),
            op,
            target: target.to_string(),
        });
    }

    fn for_node(&self, node: &str) -> Self {
        Self {
            node: node.to_string(),
            state: self.state.clone(),
        }
    }

    pub fn add_image(&self, image: &str) {
        self.state().images.insert(image.to_string());
    }

    pub fn has_image(&self, image: &str) -> bool {
        self.state().images.contains(image)
    }

    /// Exit code reported by `wait_container`.
    pub fn set_exit_code(&self, code: i64) {
        self.state().exit_code = code;
    }

    /// New containers get no host port mapping.
    pub fn unmap_ports(&self) {
        self.state().unmapped_ports = true;
    }

    /// Started containers exit immediately.
    pub fn die_on_start(&self) {
        self.state().dies_on_start = true;
    }

    /// Image pulls and pushes fail on `node`.
    pub fn fail_node(&self, node: &str) {
        self.state().failing_nodes.insert(node.to_string());
    }

    /// Removes a container as if someone else had done it.
    pub fn forget_container(&self, id: &str) {
        self.state().containers.remove(id);
    }

    pub fn container(&self, id: &str) -> Option<FakeContainer> {
        self.state().containers.get(id).cloned()
    }

    pub fn containers(&self) -> usize {
        self.state().containers.len()
    }

    pub fn calls(&self) -> Vec<Call> {
        self.state().calls.clone()
    }

    pub fn calls_of(&self, op: &str) -> Vec<Call> {
        self.calls().into_iter().filter(|c| c.op == op).collect()
    }

    fn with_container<T>(
        &self,
        op: &'static str,
        id: &str,
        f: impl FnOnce(&mut FakeState, &mut FakeContainer) -> T,
    ) -> Result<T, RuntimeError> {
        let mut state = self.state();
        self.record(&mut state, op, id);
        let Some(mut container) = state
            .containers
            .get(id)
            .filter(|c| c.node == self.node)
            .cloned()
        else {
            return Err(RuntimeError::NoSuchContainer(id.to_string()));
        };
        let result = f(&mut state, &mut container);
        state.containers.insert(id.to_string(), container);
        Ok(result)
    }
}

impl ContainerRuntime for FakeRuntime {
    async fn create_container(&self, spec: &ContainerSpec) -> Result<ContainerID, RuntimeError> {
        let mut state = self.state();
        self.record(&mut state, "create", &spec.image);
        if !state.images.contains(&spec.image) {
            return Err(RuntimeError::NoSuchImage(spec.image.clone()));
        }
        let n = state.created;
        state.created += 1;
        let id = format!("{:012x}", 0xc0ffee000 + n);
        let mut ports = HashMap::new();
        if let Some(port) = &spec.exposed_port
            && !state.unmapped_ports
        {
            ports.insert(port.clone(), (FIRST_HOST_PORT + n).to_string());
        }
        state.containers.insert(
            id.clone(),
            FakeContainer {
                node: self.node.clone(),
                spec: spec.clone(),
                ip: format!("172.17.0.{}", n + 2),
                running: false,
                started: false,
                ports,
            },
        );
        Ok(id)
    }

    async fn start_container(&self, id: &str) -> Result<(), RuntimeError> {
        self.with_container("start", id, |state, c| {
            c.started = true;
            c.running = !state.dies_on_start;
        })
    }

    async fn stop_container(&self, id: &str) -> Result<(), RuntimeError> {
        self.with_container("stop", id, |_, c| c.running = false)
    }

    async fn remove_container(&self, id: &str) -> Result<(), RuntimeError> {
        self.with_container("remove", id, |_, _| ())?;
        self.state().containers.remove(id);
        Ok(())
    }

    async fn inspect_container(&self, id: &str) -> Result<ContainerInfo, RuntimeError> {
        self.with_container("inspect", id, |_, c| ContainerInfo {
            id: id.to_string(),
            ip: c.ip.clone(),
            running: c.running,
            status: match (c.started, c.running) {
                (_, true) => "running".to_string(),
                (true, false) => "exited".to_string(),
                (false, false) => "created".to_string(),
            },
            exit_code: None,
            ports: c.ports.clone(),
        })
    }

    async fn wait_container(&self, id: &str) -> Result<i64, RuntimeError> {
        self.with_container("wait", id, |state, c| {
            c.running = false;
            state.exit_code
        })
    }

    async fn commit_container(&self, id: &str, repository: &str) -> Result<String, RuntimeError> {
        self.with_container("commit", id, |state, _| {
            state.images.insert(repository.to_string());
            format!("sha256:{:x}", state.images.len())
        })
    }

    async fn container_logs(&self, id: &str) -> Result<Vec<u8>, RuntimeError> {
        self.with_container("logs", id, |_, c| format!("{}\n", c.spec.cmd.join(" ")).into_bytes())
    }

    async fn pull_image(&self, repository: &str, registry: Option<&str>) -> Result<(), RuntimeError> {
        let name = qualified_name(repository, registry);
        let mut state = self.state();
        self.record(&mut state, "pull", &name);
        if state.failing_nodes.contains(&self.node) {
            return Err(RuntimeError::Failed(format!("cannot pull {name}")));
        }
        state.images.insert(name);
        Ok(())
    }

    async fn push_image(&self, repository: &str, registry: Option<&str>) -> Result<(), RuntimeError> {
        let name = qualified_name(repository, registry);
        let mut state = self.state();
        self.record(&mut state, "push", &name);
        if state.failing_nodes.contains(&self.node) {
            return Err(RuntimeError::Failed(format!("cannot push {name}")));
        }
        Ok(())
    }

    async fn remove_image(&self, image: &str) -> Result<(), RuntimeError> {
        let mut state = self.state();
        self.record(&mut state, "remove_image", image);
        if state.images.remove(image) {
            Ok(())
        } else {
            Err(RuntimeError::NoSuchImage(image.to_string()))
        }
    }
}

/// Hands out `FakeRuntime`s sharing one state, counting connections.
#[derive(Clone, Default)]
pub struct FakeConnector {
    runtime: FakeRuntime,
    connections: Arc<AtomicUsize>,
}

impl FakeConnector {
    pub fn runtime(&self) -> &FakeRuntime {
        &self.runtime
    }

    pub fn connections(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }
}

impl NodeConnector for FakeConnector {
    type Runtime = FakeRuntime;

    fn connect(&self, node: &Node) -> Result<FakeRuntime, RuntimeError> {
        self.connections.fetch_add(1, Ordering::SeqCst);
        Ok(self.runtime.for_node(&node.id))
    }
}

#[derive(Default)]
struct ExecState {
    commands: Vec<(String, Vec<String>)>,
    output: Vec<u8>,
    fail: bool,
}

/// Records every command and answers with canned output.
#[derive(Clone, Default)]
pub struct RecordingExecutor {
    state: Arc<Mutex<ExecState>>,
}

impl RecordingExecutor {
    fn state(&self) -> MutexGuard<'_, ExecState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Commands succeed printing `output` on stdout.
    pub fn with_output(self, output: &str) -> Self {
        {
            let mut state = self.state();
            state.output = output.as_bytes().to_vec();
            state.fail = false;
        }
        self
    }

    /// Commands exit with status 1 printing `output` on stderr.
    pub fn failing(self, output: &str) -> Self {
        {
            let mut state = self.state();
            state.output = output.as_bytes().to_vec();
            state.fail = true;
        }
        self
    }

    pub fn commands(&self) -> Vec<(String, Vec<String>)> {
        self.state().commands.clone()
    }

    pub fn executed(&self, name: &str, args: &[String]) -> bool {
        self.state()
            .commands
            .iter()
            .any(|(n, a)| n == name && a.as_slice() == args)
    }
}

impl CommandExecutor for RecordingExecutor {
    async fn execute(&self, name: &str, args: &[String]) -> std::io::Result<CommandOutput> {
        let mut state = self.state();
        state.commands.push((name.to_string(), args.to_vec()));
        let output = state.output.clone();
        Ok(if state.fail {
            CommandOutput {
                stdout: Vec::new(),
                stderr: output,
                status: Some(1),
            }
        } else {
            CommandOutput {
                stdout: output,
                stderr: Vec::new(),
                status: Some(0),
            }
        })
    }
}

#[derive(Clone, Default)]
pub struct MemoryFs {
    files: HashMap<PathBuf, String>,
}

impl MemoryFs {
    pub fn with_file(mut self, path: impl Into<PathBuf>, content: &str) -> Self {
        self.files.insert(path.into(), content.to_string());
        self
    }
}

impl FileReader for MemoryFs {
    fn read_to_string(&self, path: &Path) -> std::io::Result<String> {
        self.files.get(path).cloned().ok_or_else(|| {
            std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("{} not found", path.display()),
            )
        })
    }
}
