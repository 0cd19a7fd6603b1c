use std::fs;

use anyhow::{Context, Result, anyhow, bail};
use frankenengine_serializer::{
    EngineConfig, EngineResult, Envelope, InstrumentOptions, JsValue, Realm, SerializeOptions,
    instrument,
};

fn main() {
    if let Err(error) = run(std::env::args().skip(1).collect()) {
        eprintln!("{error:#}");
        std::process::exit(2);
    }
}

fn run(args: Vec<String>) -> Result<()> {
    if args.is_empty() {
        bail!(usage());
    }

    match args[0].as_str() {
        "instrument" => run_instrument(&args[1..]),
        "snapshot" => run_snapshot(&args[1..]),
        "resume" => run_resume(&args[1..]),
        "help" | "--help" | "-h" => {
            println!("{}", usage());
            Ok(())
        }
        other => bail!("unknown subcommand '{other}'\n\n{}", usage()),
    }
}

fn usage() -> String {
    [
        "franken-instrument usage:",
        "  franken-instrument instrument --input <script.js> [--wrap-expressions] [--output <path>]",
        "  franken-instrument snapshot --input <script.js> [--config <config.json>] [--pretty] [--events]",
        "  franken-instrument resume --input <envelope.json> [--config <config.json>] [--call] [--events]",
        "",
        "snapshot runs the instrumented script and serializes its completion value;",
        "resume rebuilds an envelope in a fresh realm and prints the value",
        "(calling it with no arguments first when --call is given).",
    ]
    .join("\n")
}

#[derive(Debug, Default)]
struct Flags {
    input: Option<String>,
    output: Option<String>,
    config: Option<String>,
    wrap_expressions: bool,
    pretty: bool,
    events: bool,
    call: bool,
}

fn parse_flags(command: &str, args: &[String], allowed: &[&str]) -> Result<Flags> {
    let mut flags = Flags::default();
    let mut index = 0usize;
    while index < args.len() {
        let flag = args[index].as_str();
        if !allowed.contains(&flag) {
            bail!("unknown flag for {command}: {flag}");
        }
        match flag {
            "--input" | "--output" | "--config" => {
                index += 1;
                let value = args
                    .get(index)
                    .ok_or_else(|| anyhow!("{flag} requires a path"))?
                    .clone();
                match flag {
                    "--input" => flags.input = Some(value),
                    "--output" => flags.output = Some(value),
                    _ => flags.config = Some(value),
                }
            }
            "--wrap-expressions" => flags.wrap_expressions = true,
            "--pretty" => flags.pretty = true,
            "--events" => flags.events = true,
            "--call" => flags.call = true,
            _ => bail!("unknown flag for {command}: {flag}"),
        }
        index += 1;
    }
    Ok(flags)
}

fn read_input(flags: &Flags) -> Result<String> {
    let path = flags
        .input
        .as_deref()
        .ok_or_else(|| anyhow!("missing required --input <path>"))?;
    fs::read_to_string(path).with_context(|| format!("failed to read input {path}"))
}

fn load_config(flags: &Flags) -> Result<EngineConfig> {
    let Some(path) = flags.config.as_deref() else {
        return Ok(EngineConfig::default());
    };
    let text = fs::read_to_string(path).with_context(|| format!("failed to read config {path}"))?;
    EngineConfig::from_json(&text).with_context(|| format!("failed to parse config {path}"))
}

/// Engine errors carry their stable code into the CLI message.
fn engine<T>(result: EngineResult<T>) -> Result<T> {
    result.map_err(|error| anyhow!("{}: {error}", error.stable_code()))
}

fn print_events(realm: &mut Realm) -> Result<()> {
    for event in realm.drain_events() {
        let line = serde_json::to_string(&event).context("failed to encode event")?;
        println!("{line}");
    }
    Ok(())
}

fn run_instrument(args: &[String]) -> Result<()> {
    let flags = parse_flags("instrument", args, &["--input", "--output", "--wrap-expressions"])?;
    let source = read_input(&flags)?;
    let options = InstrumentOptions {
        wrap_expressions: flags.wrap_expressions,
    };
    let output = instrument(&source, &options).map_err(|error| anyhow!("{error}"))?;
    match flags.output.as_deref() {
        Some(path) => fs::write(path, output).with_context(|| format!("failed to write {path}"))?,
        None => println!("{output}"),
    }
    Ok(())
}

fn run_snapshot(args: &[String]) -> Result<()> {
    let flags = parse_flags("snapshot", args, &["--input", "--config", "--pretty", "--events"])?;
    let source = read_input(&flags)?;
    let mut realm = engine(Realm::new(load_config(&flags)?))?;
    let value = engine(realm.eval_instrumented(&source))?;
    let envelope = engine(realm.serialize(&value, SerializeOptions::default()))?;
    let text = if flags.pretty {
        engine(envelope.to_json_pretty())?
    } else {
        engine(envelope.to_json_string())?
    };
    println!("{text}");
    if flags.events {
        print_events(&mut realm)?;
    }
    Ok(())
}

fn run_resume(args: &[String]) -> Result<()> {
    let flags = parse_flags("resume", args, &["--input", "--config", "--call", "--events"])?;
    let text = read_input(&flags)?;
    let envelope = engine(Envelope::from_json_str(&text))?;
    let mut realm = engine(Realm::new(load_config(&flags)?))?;
    let mut value = engine(realm.deserialize(&envelope))?;
    if flags.call {
        value = engine(realm.call_function(&value, JsValue::Undefined, &[]))?;
    }
    println!("{}", realm.display_value(&value));
    if flags.events {
        print_events(&mut realm)?;
    }
    Ok(())
}
