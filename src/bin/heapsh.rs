//! refzero heap shell
//!
//! Interactive heap inspector: allocate cells, wire them together, drop
//! references, install finalizers and run collections, watching what gets
//! freed. Set `REFZERO_LOG=trace` to see every queue and free event.

use ahash::AHashMap;
use regex::Regex;
use refzero::gc::RootId;
use refzero::{Context, HeapConfig, HeapError, NativeFunctionId, SweepFlags, Value};
use rustyline::DefaultEditor;
use rustyline::error::ReadlineError;
use tracing_subscriber::EnvFilter;

const HELP: &str = "\
commands:
  obj NAME [PROTO]        allocate an object
  str NAME TEXT           intern a string
  buf NAME LEN [dynamic]  allocate a buffer
  set OBJ KEY VALUE       store a property (VALUE: name, number, null, undefined)
  get OBJ KEY             read a property
  drop NAME               release the shell's reference
  root NAME               register NAME as a global root
  unroot NAME             remove NAME's global root
  fin OBJ                 install a logging finalizer
  gc [emergency|nofin]    run mark-and-sweep
  stats                   show heap statistics
  help                    show this text
  quit                    exit";

#[derive(Debug, thiserror::Error)]
enum ShellError {
    #[error(transparent)]
    Heap(#[from] HeapError),
    #[error("unknown name `{0}`")]
    UnknownName(String),
    #[error("`{0}` is not a heap cell")]
    NotACell(String),
    #[error("unrecognized command, try `help`")]
    Unrecognized,
}

enum Command {
    Obj { name: String, proto: Option<String> },
    Str { name: String, text: String },
    Buf { name: String, len: usize, dynamic: bool },
    Set { obj: String, key: String, value: String },
    Get { obj: String, key: String },
    Drop(String),
    Root(String),
    Unroot(String),
    Fin(String),
    Gc(SweepFlags),
    Stats,
    Help,
    Quit,
}

struct Parser {
    obj: Regex,
    str: Regex,
    buf: Regex,
    set: Regex,
    get: Regex,
    unary: Regex,
    gc: Regex,
}

impl Parser {
    fn new() -> Result<Self, regex::Error> {
        Ok(Parser {
            obj: Regex::new(r"^obj\s+(\w+)(?:\s+(\w+))?$")?,
            str: Regex::new(r"^str\s+(\w+)\s+(.+)$")?,
            buf: Regex::new(r"^buf\s+(\w+)\s+(\d+)(\s+dynamic)?$")?,
            set: Regex::new(r"^set\s+(\w+)\s+(\S+)\s+(\S+)$")?,
            get: Regex::new(r"^get\s+(\w+)\s+(\S+)$")?,
            unary: Regex::new(r"^(drop|root|unroot|fin)\s+(\w+)$")?,
            gc: Regex::new(r"^gc(?:\s+(emergency|nofin))?$")?,
        })
    }

    fn parse(&self, line: &str) -> Option<Command> {
        match line {
            "stats" => return Some(Command::Stats),
            "help" => return Some(Command::Help),
            "quit" | "exit" => return Some(Command::Quit),
            _ => {}
        }
        if let Some(c) = self.obj.captures(line) {
            return Some(Command::Obj {
                name: c[1].to_string(),
                proto: c.get(2).map(|m| m.as_str().to_string()),
            });
        }
        if let Some(c) = self.str.captures(line) {
            return Some(Command::Str {
                name: c[1].to_string(),
                text: c[2].to_string(),
            });
        }
        if let Some(c) = self.buf.captures(line) {
            return Some(Command::Buf {
                name: c[1].to_string(),
                len: c[2].parse().ok()?,
                dynamic: c.get(3).is_some(),
            });
        }
        if let Some(c) = self.set.captures(line) {
            return Some(Command::Set {
                obj: c[1].to_string(),
                key: c[2].to_string(),
                value: c[3].to_string(),
            });
        }
        if let Some(c) = self.get.captures(line) {
            return Some(Command::Get {
                obj: c[1].to_string(),
                key: c[2].to_string(),
            });
        }
        if let Some(c) = self.unary.captures(line) {
            let name = c[2].to_string();
            return Some(match &c[1] {
                "drop" => Command::Drop(name),
                "root" => Command::Root(name),
                "unroot" => Command::Unroot(name),
                _ => Command::Fin(name),
            });
        }
        if let Some(c) = self.gc.captures(line) {
            let flags = match c.get(1).map(|m| m.as_str()) {
                Some("emergency") => SweepFlags::EMERGENCY,
                Some(_) => SweepFlags::SKIP_FINALIZERS,
                None => SweepFlags::empty(),
            };
            return Some(Command::Gc(flags));
        }
        None
    }
}

struct Shell {
    ctx: Context,
    /// Each named value holds one reference
    names: AHashMap<String, Value>,
    roots: AHashMap<String, RootId>,
    finalizer: NativeFunctionId,
}

impl Shell {
    fn new() -> Result<Self, ShellError> {
        let mut ctx = Context::new(HeapConfig::default())?;
        let finalizer = ctx.heap_mut().register_native(|_, args| {
            if let Some(v) = args.first() {
                println!("finalizing {}", v);
            }
            Ok(Value::undefined())
        });
        Ok(Shell {
            ctx,
            names: AHashMap::new(),
            roots: AHashMap::new(),
            finalizer,
        })
    }

    fn lookup(&self, name: &str) -> Result<Value, ShellError> {
        self.names
            .get(name)
            .copied()
            .ok_or_else(|| ShellError::UnknownName(name.to_string()))
    }

    fn lookup_cell(&self, name: &str) -> Result<refzero::CellRef, ShellError> {
        self.lookup(name)?
            .as_cell()
            .ok_or_else(|| ShellError::NotACell(name.to_string()))
    }

    fn operand(&self, text: &str) -> Result<Value, ShellError> {
        match text {
            "null" => Ok(Value::null()),
            "undefined" => Ok(Value::undefined()),
            "true" => Ok(Value::bool(true)),
            "false" => Ok(Value::bool(false)),
            _ => match text.parse::<f64>() {
                Ok(n) => Ok(Value::number(n)),
                Err(_) => self.lookup(text),
            },
        }
    }

    /// Bind a freshly owned value, releasing whatever the name held before
    fn bind(&mut self, name: String, value: Value) {
        println!("{} = {}", name, value);
        if let Some(old) = self.names.insert(name, value) {
            self.ctx.heap_mut().decref(old);
        }
    }

    fn run(&mut self, cmd: Command) -> Result<bool, ShellError> {
        match cmd {
            Command::Obj { name, proto } => {
                let proto = match proto {
                    Some(p) => Some(self.lookup_cell(&p)?),
                    None => self.ctx.builtin(refzero::vm::BuiltinId::ObjectPrototype),
                };
                let r = self.ctx.heap_mut().alloc_object(proto)?;
                self.bind(name, Value::cell(r));
            }
            Command::Str { name, text } => {
                let r = self.ctx.heap_mut().intern(&text)?;
                self.bind(name, Value::cell(r));
            }
            Command::Buf { name, len, dynamic } => {
                let r = self.ctx.heap_mut().alloc_buffer(len, dynamic)?;
                self.bind(name, Value::cell(r));
            }
            Command::Set { obj, key, value } => {
                let obj = self.lookup_cell(&obj)?;
                let value = self.operand(&value)?;
                let heap = self.ctx.heap_mut();
                let key = heap.intern(&key)?;
                let result = heap.put_prop(obj, key, value);
                heap.decref_cell(key);
                result?;
            }
            Command::Get { obj, key } => {
                let obj = self.lookup_cell(&obj)?;
                let heap = self.ctx.heap_mut();
                let key = heap.intern(&key)?;
                let result = heap.get_prop(obj, key);
                heap.decref_cell(key);
                match result? {
                    Some(slot) => println!("{:?}", slot),
                    None => println!("undefined"),
                }
            }
            Command::Drop(name) => {
                let value = self
                    .names
                    .remove(&name)
                    .ok_or(ShellError::UnknownName(name))?;
                self.ctx.heap_mut().decref(value);
            }
            Command::Root(name) => {
                let value = self.lookup(&name)?;
                let id = self.ctx.heap_mut().add_root(value)?;
                if let Some(old) = self.roots.insert(name, id) {
                    self.ctx.heap_mut().remove_root(old);
                }
            }
            Command::Unroot(name) => {
                let id = self
                    .roots
                    .remove(&name)
                    .ok_or(ShellError::UnknownName(name))?;
                self.ctx.heap_mut().remove_root(id);
            }
            Command::Fin(name) => {
                let obj = self.lookup_cell(&name)?;
                let fin = Value::native(self.finalizer);
                self.ctx.heap_mut().set_finalizer(obj, fin)?;
            }
            Command::Gc(flags) => {
                let ran = self.ctx.heap_mut().run_mark_and_sweep(flags);
                println!("ran: {}, {:?}", ran, self.ctx.last_gc());
            }
            Command::Stats => println!("{:#?}", self.ctx.stats()),
            Command::Help => println!("{}", HELP),
            Command::Quit => return Ok(false),
        }
        Ok(true)
    }
}

fn install_subscriber() {
    let filter = EnvFilter::try_from_env("REFZERO_LOG").unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn main() {
    install_subscriber();

    let parser = match Parser::new() {
        Ok(p) => p,
        Err(e) => {
            eprintln!("Error building command parser: {}", e);
            std::process::exit(1);
        }
    };
    let mut shell = match Shell::new() {
        Ok(s) => s,
        Err(e) => {
            eprintln!("Error creating heap: {}", e);
            std::process::exit(1);
        }
    };
    let mut rl = match DefaultEditor::new() {
        Ok(rl) => rl,
        Err(e) => {
            eprintln!("Error initializing line editor: {}", e);
            std::process::exit(1);
        }
    };

    println!("refzero heap shell, `help` for commands");
    loop {
        match rl.readline("heap> ") {
            Ok(line) => {
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                let _ = rl.add_history_entry(line);
                let result = match parser.parse(line) {
                    Some(cmd) => shell.run(cmd),
                    None => Err(ShellError::Unrecognized),
                };
                match result {
                    Ok(true) => {}
                    Ok(false) => break,
                    Err(e) => println!("Error: {}", e),
                }
            }
            Err(ReadlineError::Interrupted) => continue,
            Err(ReadlineError::Eof) => break,
            Err(e) => {
                eprintln!("Error reading input: {}", e);
                break;
            }
        }
    }
}
