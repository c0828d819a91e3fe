//! Sample functions callable from a `TimeoutExecutor`.

use std::time::Duration;

use serde::Deserialize;
use serde_json::{Value, json};
use timebox_core::{Arguments, Registry, TaskError, TaskResult};

/// Every function this worker exposes.
pub fn registry() -> Registry {
    Registry::new()
        .register("echo_args", echo_args)
        .register("add", add)
        .register("sleep_for", sleep_for)
        .register_async("sleep_async", sleep_async)
        .register("raise_runtime", raise_runtime)
        .register("raise_chained", raise_chained)
        .register("parse_int", parse_int)
        .register("distance", distance)
        .register("explode", |_| panic!("target exploded"))
        .register("exit_silently", exit_silently)
        .register("print_and_return", print_and_return)
        .register("set_env", set_env)
        .register("get_env", get_env)
}

fn echo_args(args: &Arguments) -> TaskResult {
    Ok(json!({ "args": args.args, "kwargs": args.kwargs }))
}

fn add(args: &Arguments) -> TaskResult {
    let a: i64 = args.positional(0)?;
    let b: i64 = args.positional(1)?;
    Ok(json!(a + b))
}

fn sleep_for(args: &Arguments) -> TaskResult {
    let secs: f64 = args.positional(0)?;
    std::thread::sleep(Duration::from_secs_f64(secs));
    Ok(json!(secs))
}

async fn sleep_async(args: Arguments) -> TaskResult {
    let secs: f64 = args.positional(0)?;
    tokio::time::sleep(Duration::from_secs_f64(secs)).await;
    Ok(json!(secs))
}

fn raise_runtime(args: &Arguments) -> TaskResult {
    Err(TaskError::with_args("RuntimeError", args.args.clone()))
}

fn raise_chained(_: &Arguments) -> TaskResult {
    let inner = TaskError::new("ValueError", "Inner");
    Err(TaskError::new("RuntimeError", "Outer").caused_by(inner))
}

fn parse_int(args: &Arguments) -> TaskResult {
    let text: String = args.positional(0)?;
    let n: i64 = text.trim().parse().map_err(|e| TaskError::from_error(&e))?;
    Ok(json!(n))
}

#[derive(Debug, Deserialize)]
struct Point {
    x: f64,
    y: f64,
}

fn distance(args: &Arguments) -> TaskResult {
    let a: Point = args.keyword("from")?.unwrap_or(Point { x: 0.0, y: 0.0 });
    let b: Point = args
        .keyword("to")?
        .ok_or_else(|| TaskError::new("TypeError", "missing keyword argument 'to'"))?;
    Ok(json!((b.x - a.x).hypot(b.y - a.y)))
}

/// Exits before an outcome can be written.
fn exit_silently(args: &Arguments) -> TaskResult {
    let code: i32 = args.positional(0).unwrap_or(0);
    std::process::exit(code)
}

fn print_and_return(args: &Arguments) -> TaskResult {
    let text: String = args.positional(0)?;
    println!("{}", text);
    eprintln!("{}", text);
    Ok(Value::String(text))
}

/// Initializer: set an environment variable for the target to observe.
fn set_env(args: &Arguments) -> TaskResult {
    let key: String = args.positional(0)?;
    let value: String = args.positional(1)?;
    // SAFETY: initializers run before the target, while the worker is single-threaded.
    unsafe { std::env::set_var(&key, &value) };
    Ok(Value::Null)
}

fn get_env(args: &Arguments) -> TaskResult {
    let key: String = args.positional(0)?;
    Ok(std::env::var(&key).map(Value::String).unwrap_or(Value::Null))
}
