// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright 2026 Tobias Sarnowski

//! Smalt runner: load an image, build the initial process, execute
//! it to completion and report what happened.

use std::fs::File;
use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context as _, Result};
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use smalt_vm::memory::DEFAULT_SPACE_WORDS;
use smalt_vm::object::Oop;
use smalt_vm::object::layout::{context, method, process};
use smalt_vm::{Outcome, Vm, backtrace, execute, image};

/// Smalt virtual machine.
#[derive(Parser, Debug)]
#[command(name = "smalt")]
#[command(version = smalt_vm::VERSION)]
#[command(about = "Run a Smalt heap image", long_about = None)]
struct Cli {
    /// Image file to boot from
    #[arg(default_value = "smalt.img")]
    image: PathBuf,

    /// Words per heap space
    #[arg(short = 'd', long, default_value_t = DEFAULT_SPACE_WORDS)]
    heap_words: usize,

    /// Verbose collector and interpreter logging
    #[arg(short = 'g', long)]
    debug: bool,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let default_filter = if cli.debug { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)),
        )
        .with_writer(std::io::stderr)
        .init();

    match run(&cli) {
        Ok(code) => code,
        Err(err) => {
            eprintln!("smalt: {err:#}");
            ExitCode::FAILURE
        }
    }
}

fn run(cli: &Cli) -> Result<ExitCode> {
    let mut file = File::open(&cli.image)
        .with_context(|| format!("cannot open image file {}", cli.image.display()))?;
    let mut vm = image::read_image(&mut file, cli.heap_words)
        .with_context(|| format!("cannot load image {}", cli.image.display()))?;
    drop(file);

    let proc_obj = build_initial_process(&mut vm)?;

    vm.memory
        .push_root(proc_obj)
        .context("cannot pin the initial process")?;
    let outcome = execute(&mut vm, 0).context("interpreter fault")?;
    let proc_obj = vm.memory.pop_root();

    let code = match outcome {
        Outcome::UserDefined => {
            println!("user defined return");
            outcome.code()
        }
        Outcome::BadMethod => {
            let selector = vm.memory.field(proc_obj, process::RESULT);
            println!("unknown method: {}", vm.read_text(selector));
            let top = vm.memory.field(proc_obj, process::CONTEXT);
            print!("{}", backtrace(&vm, top));
            outcome.code()
        }
        Outcome::Returned => {
            println!("normal return");
            0
        }
        Outcome::TimeExpired => {
            println!("time expired");
            outcome.code()
        }
        Outcome::Breakpoint => {
            println!("breakpoint");
            outcome.code()
        }
    };

    report_statistics(&vm);
    Ok(ExitCode::from(code as u8))
}

/// Build the process that boots the image: a fresh context around the
/// entry method, wired exactly like an interpreter-made activation.
fn build_initial_process(vm: &mut Vm) -> Result<Oop> {
    let entry = vm.initial_method();
    let stack_size = small_field(vm, entry, method::STACK_SIZE)?;
    let temporary_size = small_field(vm, entry, method::TEMPORARY_SIZE)?;

    let ctx = vm.alloc_object(context::SIZE)?;
    let context_class = vm.context_class();
    vm.memory.set_class_word(ctx, context_class);
    vm.memory.push_root(ctx)?;

    let stack = vm.new_array(stack_size)?;
    {
        let ctx = vm.memory.root_at(vm.memory.root_depth() - 1);
        vm.memory.set_field(ctx, context::STACK, stack);
    }
    let temporaries = vm.new_array(temporary_size)?;
    {
        let ctx = vm.memory.root_at(vm.memory.root_depth() - 1);
        vm.memory.set_field(ctx, context::TEMPORARIES, temporaries);
    }
    let proc_obj = vm.alloc_object(process::SIZE)?;
    let ctx = vm.memory.pop_root();

    let entry = vm.initial_method();
    let nil = vm.nil();
    vm.memory.set_field(ctx, context::METHOD, entry);
    vm.memory.set_field(ctx, context::ARGUMENTS, nil);
    vm.memory.set_field(ctx, context::BYTE_POINTER, Oop::small(0));
    vm.memory.set_field(ctx, context::STACK_TOP, Oop::small(0));
    vm.memory.set_field(ctx, context::PREVIOUS_CONTEXT, nil);

    let process_class = vm
        .lookup_global("Process")
        .context("image has no Process class")?;
    vm.memory.set_class_word(proc_obj, process_class);
    vm.memory.set_field(proc_obj, process::CONTEXT, ctx);
    vm.memory.set_field(proc_obj, process::STATUS, nil);
    vm.memory.set_field(proc_obj, process::RESULT, nil);

    info!(
        stack_size,
        temporary_size,
        "initial process built around the entry method"
    );
    Ok(proc_obj)
}

fn small_field(vm: &Vm, obj: Oop, index: usize) -> Result<usize> {
    let value = vm.memory.field(obj, index);
    anyhow::ensure!(
        value.is_small_int() && value.value() >= 0,
        "entry method is malformed"
    );
    Ok(value.value() as usize)
}

fn report_statistics(vm: &Vm) {
    let hits = vm.cache.hits;
    let misses = vm.cache.misses;
    let total = hits + misses;
    println!("\ncache statistics:");
    if total > 0 {
        println!(
            "  {hits} hits, {misses} misses, {:.2}% hit rate",
            hits as f64 * 100.0 / total as f64
        );
    } else {
        println!("  no sends");
    }

    let stats = vm.memory.stats();
    println!("gc statistics:");
    println!("  {} collections", stats.count);
    println!(
        "  {} us total, {} us longest pause",
        stats.total_pause.as_micros(),
        stats.max_pause.as_micros()
    );
    println!(
        "  {} bytes copied in total, {} bytes in the largest pass",
        stats.bytes_copied, stats.max_bytes_copied
    );
}
