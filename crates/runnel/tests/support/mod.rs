//! A tiny line-oriented interpreter used to drive the orchestrator in tests.
//!
//! Each line of a program is one command:
//!
//! | command           | effect                                             |
//! |-------------------|----------------------------------------------------|
//! | `print <text>`    | write `<text>`                                     |
//! | `echo`            | read a line of input and write it                  |
//! | `raise <msg>`     | fail with `Exception: <msg>`                       |
//! | `spin`            | loop until the context is destroyed                |
//! | `sleep <ms>`      | busy-wait                                          |
//! | `set <k> <v>`     | bind a name in the run's namespace                 |
//! | `get <k>`         | write a bound name                                 |
//! | `import <m>`      | load `/<m>.toy` (`key = value` lines) once         |
//! | `show <m> <k>`    | write a key of an imported module                  |
//! | `argv`            | write the interpreter arguments                    |
//! | `packages`        | write the installed packages                       |
//! | `write <p> <txt>` | write a file                                       |

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Once;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use runnel::{ExecutionError, Host, Interpreter, InterpreterError, InterpreterFactory, harness, reload};

static INIT_TRACING: Once = Once::new();

pub fn init_tracing() {
    INIT_TRACING.call_once(|| {
        tracing_subscriber::fmt()
            .with_env_filter("runnel=debug")
            .with_test_writer()
            .init();
    });
}

pub const VERSION: &str = "toy-1.0";

/// Creates [`Toy`] interpreters and counts what they do.
#[derive(Debug, Clone, Default)]
pub struct ToyFactory {
    pub boots: Arc<AtomicUsize>,
    pub runs: Arc<AtomicUsize>,
    pub boot_delay: Duration,
}

impl ToyFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_boot_delay(mut self, delay: Duration) -> Self {
        self.boot_delay = delay;
        self
    }

    pub fn boots(&self) -> usize {
        self.boots.load(Ordering::SeqCst)
    }

    pub fn runs(&self) -> usize {
        self.runs.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl InterpreterFactory for ToyFactory {
    async fn boot(&self, args: &[String]) -> Result<Box<dyn Interpreter>, InterpreterError> {
        if args.iter().any(|a| a == "--fail-boot") {
            return Err(InterpreterError::Boot("refusing to boot".to_string()));
        }
        std::thread::sleep(self.boot_delay);
        self.boots.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(Toy {
            args: args.to_vec(),
            runs: Arc::clone(&self.runs),
            modules: HashMap::new(),
            packages: Vec::new(),
            messages: vec!["Python initialization complete".to_string()],
        }))
    }
}

/// The interpreter itself. Imported modules survive across runs, like a
/// module registry; everything else is per run.
pub struct Toy {
    args: Vec<String>,
    runs: Arc<AtomicUsize>,
    modules: HashMap<String, HashMap<String, String>>,
    packages: Vec<String>,
    messages: Vec<String>,
}

fn check_packages(packages: &[String]) -> Result<(), InterpreterError> {
    match packages.iter().find(|p| p.as_str() == "broken") {
        Some(p) => Err(InterpreterError::Package(format!("no such package: {p}"))),
        None => Ok(()),
    }
}

fn raise(message: impl std::fmt::Display) -> ExecutionError {
    ExecutionError::Raised(format!("Exception: {message}"))
}

impl Toy {
    fn load_module(&mut self, name: &str, host: &mut Host<'_>) -> Result<(), ExecutionError> {
        let path = format!("/{name}.toy");
        let source = host
            .fs()
            .read_to_string(&path)
            .map_err(|_| ExecutionError::Raised(format!("ModuleNotFoundError: {name}")))?;
        let bindings = source
            .lines()
            .filter_map(|line| line.split_once(" = "))
            .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
            .collect();
        self.modules.insert(name.to_string(), bindings);
        Ok(())
    }

    fn exec(
        &mut self,
        program: &str,
        namespace: &mut HashMap<String, String>,
        host: &mut Host<'_>,
    ) -> Result<(), ExecutionError> {
        for line in program.lines() {
            let line = line.trim();
            let (command, rest) = line.split_once(' ').unwrap_or((line, ""));
            match command {
                "" => {}
                "print" => host.write_line(rest)?,
                "echo" => {
                    let input = host.read_line()?;
                    host.write_line(&input)?;
                }
                "raise" => return Err(raise(rest)),
                "spin" => loop {
                    host.check_alive()?;
                    std::thread::sleep(Duration::from_millis(1));
                },
                "sleep" => {
                    let ms = rest.parse().map_err(|_| raise("bad duration"))?;
                    host.sleep(Duration::from_millis(ms))?;
                }
                "set" => {
                    let (key, value) = rest.split_once(' ').unwrap_or((rest, ""));
                    namespace.insert(key.to_string(), value.to_string());
                }
                "get" => {
                    let value = namespace
                        .get(rest)
                        .cloned()
                        .ok_or_else(|| ExecutionError::Raised(format!("NameError: {rest}")))?;
                    host.write_line(&value)?;
                }
                "import" => {
                    if !self.modules.contains_key(rest) {
                        self.load_module(rest, host)?;
                    }
                }
                "show" => {
                    let (module, key) = rest.split_once(' ').unwrap_or((rest, ""));
                    let value = self
                        .modules
                        .get(module)
                        .and_then(|m| m.get(key))
                        .cloned()
                        .ok_or_else(|| raise(format!("{module}.{key} is not defined")))?;
                    host.write_line(&value)?;
                }
                "argv" => host.write_line(&self.args.join(" "))?,
                "packages" => host.write_line(&self.packages.join(" "))?,
                "write" => {
                    let (path, text) = rest.split_once(' ').unwrap_or((rest, ""));
                    host.fs().write(path, text).map_err(raise)?;
                }
                other => return Err(raise(format!("unknown command {other}"))),
            }
        }
        Ok(())
    }
}

#[async_trait]
impl Interpreter for Toy {
    fn version(&self) -> String {
        VERSION.to_string()
    }

    fn package_installer(&self) -> Option<&str> {
        Some("micropip")
    }

    async fn load_packages(&mut self, packages: &[String]) -> Result<(), InterpreterError> {
        check_packages(packages)?;
        self.packages.extend(packages.iter().cloned());
        Ok(())
    }

    async fn install_packages(&mut self, packages: &[String]) -> Result<(), InterpreterError> {
        check_packages(packages)?;
        if !self.packages.iter().any(|p| p == "micropip") {
            return Err(InterpreterError::Package("installer not loaded".to_string()));
        }
        self.packages.extend(packages.iter().cloned());
        Ok(())
    }

    fn drain_messages(&mut self) -> Vec<String> {
        std::mem::take(&mut self.messages)
    }

    fn run(&mut self, source: &str, host: &mut Host<'_>) -> Result<(), ExecutionError> {
        if let Some(modules) = reload::parse(source) {
            for module in modules {
                if self.modules.contains_key(&module) {
                    self.load_module(&module, host)?;
                }
            }
            return Ok(());
        }

        let Some(invocation) = harness::parse(source) else {
            return self.exec(source, &mut HashMap::new(), host);
        };
        self.runs.fetch_add(1, Ordering::SeqCst);

        let mut namespace = HashMap::new();
        let result = self
            .exec(&invocation.preamble, &mut namespace, host)
            .and_then(|()| self.exec(&invocation.code, &mut namespace, host));
        // The harness always ends a run with a blank line.
        let trailer = host.write_line("");
        result.and(trailer)
    }
}
