//! `vimap run`: stream lines through a process pool

use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use serde_json::{json, Map, Value as JsonValue};
use tracing::{info, warn};
use vimap_config::VimapConfig;
use vimap_pool::{Pool, ProcessLauncher, WorkerSpec};

use crate::builtins;

/// Options collected from the `run` subcommand
pub struct RunOptions {
    pub transform: String,
    pub workers: Option<usize>,
    pub input: Option<PathBuf>,
    pub json: bool,
    pub init_args: String,
    pub init_kwargs: String,
    pub eager: bool,
    pub log_level: Option<String>,
}

/// Parse the JSON-encoded initialization arguments of a worker
pub fn parse_init(init_args: &str, init_kwargs: &str) -> Result<(Vec<JsonValue>, Map<String, JsonValue>)> {
    let args: Vec<JsonValue> =
        serde_json::from_str(init_args).context("--init-args must be a JSON array")?;
    let kwargs: Map<String, JsonValue> =
        serde_json::from_str(init_kwargs).context("--init-kwargs must be a JSON object")?;
    Ok((args, kwargs))
}

fn open_input(path: Option<&PathBuf>) -> Result<Box<dyn BufRead + Send>> {
    match path {
        Some(path) => {
            let file = File::open(path).context(format!("Failed to open input {:?}", path))?;
            Ok(Box::new(BufReader::new(file)))
        }
        None => Ok(Box::new(BufReader::new(std::io::stdin()))),
    }
}

/// Lines paired with the value sent to workers for each
fn input_lines(reader: Box<dyn BufRead + Send>, json: bool) -> impl Iterator<Item = (String, JsonValue)> + Send {
    reader
        .lines()
        .filter_map(|line| match line {
            Ok(line) => Some(line),
            Err(e) => {
                warn!("Stopped reading input: {}", e);
                None
            }
        })
        .filter(|line| !line.is_empty())
        .filter_map(move |line| {
            if !json {
                let value = JsonValue::String(line.clone());
                return Some((line, value));
            }
            match serde_json::from_str(&line) {
                Ok(value) => Some((line, value)),
                Err(e) => {
                    warn!("Skipping line that is not JSON ({}): {}", e, line);
                    None
                }
            }
        })
}

/// Pulls from a blocking iterator without stalling the runtime's other tasks
///
/// The pool pulls inputs from inside async code, and reading stdin can
/// block for as long as the producer on the other end of the pipe likes.
/// Requires the multi-threaded runtime.
struct OffRuntime<I>(I);

impl<I: Iterator> Iterator for OffRuntime<I> {
    type Item = I::Item;

    fn next(&mut self) -> Option<Self::Item> {
        tokio::task::block_in_place(|| self.0.next())
    }
}

pub async fn run_command(config: VimapConfig, options: RunOptions) -> Result<()> {
    let registry = builtins::registry();
    if !registry.contains(&options.transform) {
        return Err(anyhow::anyhow!(
            "Unknown transform: {}. Run `vimap transforms` to list them",
            options.transform
        ));
    }

    let (init_args, init_kwargs) = parse_init(&options.init_args, &options.init_kwargs)?;
    let spec = WorkerSpec {
        transform: options.transform.clone(),
        init_args,
        init_kwargs,
    };

    let mut launcher = ProcessLauncher::current_exe()?;
    if let Some(level) = &options.log_level {
        launcher = launcher.with_log_level(level.clone());
    }

    let mut pool: Pool<String, JsonValue> =
        Pool::unlabeled(spec, options.workers, Arc::new(launcher), config.pool);
    pool.fork().await.context("Failed to start workers")?;
    info!(
        transform = %options.transform,
        workers = pool.stats().workers,
        "Worker pool started"
    );

    let lines = OffRuntime(input_lines(open_input(options.input.as_ref())?, options.json));
    if options.eager {
        pool.map_pretransformed(lines)?;
    } else {
        pool.imap_pretransformed(lines)?;
    }

    let mut results = pool.zip_in_out();
    let mut produced = 0usize;
    while let Some((input, output)) = results.next().await? {
        println!("{}", json!({ "input": input, "output": output }));
        produced += 1;
    }

    // no-op when close_if_done already shut the pool down
    pool.finish().await?;
    info!(produced, stats = ?pool.stats(), "Run complete");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Cursor, Read};

    #[test]
    fn test_parse_init() {
        let (args, kwargs) = parse_init("[1, 2]", r#"{"prefix": "> "}"#).unwrap();
        assert_eq!(args, vec![json!(1), json!(2)]);
        assert_eq!(kwargs.get("prefix"), Some(&json!("> ")));

        assert!(parse_init("{}", "{}").is_err());
        assert!(parse_init("[]", "[]").is_err());
    }

    #[test]
    fn test_input_lines_as_strings() {
        let reader = Box::new(Cursor::new("a\n\nb\n"));
        let lines: Vec<_> = input_lines(reader, false).collect();
        assert_eq!(
            lines,
            vec![
                ("a".to_string(), json!("a")),
                ("b".to_string(), json!("b")),
            ]
        );
    }

    #[test]
    fn test_input_lines_as_json_skips_invalid() {
        let reader = Box::new(Cursor::new("1\nnot json\n{\"x\": 2}\n"));
        let values: Vec<_> = input_lines(reader, true).map(|(_, v)| v).collect();
        assert_eq!(values, vec![json!(1), json!({"x": 2})]);
    }

    /// Reader fed from another task, like a pipe whose writer is slow
    struct ChunkReader {
        chunks: std::sync::mpsc::Receiver<Vec<u8>>,
        current: Cursor<Vec<u8>>,
    }

    impl std::io::Read for ChunkReader {
        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            loop {
                let read = self.current.read(buf)?;
                if read > 0 {
                    return Ok(read);
                }
                match self.chunks.recv() {
                    Ok(chunk) => self.current = Cursor::new(chunk),
                    Err(_) => return Ok(0),
                }
            }
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 1)]
    async fn test_blocked_input_leaves_worker_free() {
        let (tx, rx) = std::sync::mpsc::channel();
        let reader = ChunkReader {
            chunks: rx,
            current: Cursor::new(Vec::new()),
        };

        // the only worker thread is busy pulling lines when the writer runs
        let collector = tokio::spawn(async move {
            OffRuntime(input_lines(Box::new(BufReader::new(reader)), false))
                .map(|(_, value)| value)
                .collect::<Vec<_>>()
        });
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
            tx.send(b"a\n".to_vec()).unwrap();
            tx.send(b"b\n".to_vec()).unwrap();
        });

        let values = tokio::time::timeout(std::time::Duration::from_secs(10), collector)
            .await
            .expect("input reader stalled the runtime")
            .unwrap();
        assert_eq!(values, vec![json!("a"), json!("b")]);
    }
}
