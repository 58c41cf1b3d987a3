use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use fault_injector::prelude::*;
use std::hint::black_box;
use std::sync::Arc;

const VICTIM: &str = r#"{
    registers: [{ name: "rax" }, { name: "rbx" }, { name: "ecx", size: 4 }],
    instructions: [
        { address: "0x1000", disassembly: "add rax, rbx", reads: ["rax", "rbx"], writes: ["rax"] },
        { address: "0x1004", disassembly: "imul rbx, rax", reads: ["rbx", "rax"], writes: ["rbx"] },
        { address: "0x1008", disassembly: "mov ecx, eax", reads: ["rax"], writes: ["ecx"] },
    ],
    blocks: [[0, 1, 2]],
    ranks: [{ threads: [
        { blocks: [0], iterations: 20000 },
        { blocks: [0], iterations: 20000 },
        { blocks: [0], iterations: 20000 },
        { blocks: [0], iterations: 20000 },
    ] }],
}"#;

fn counting_session(granularity: Granularity) -> Session {
    let config = SessionConfig {
        granularity,
        ..SessionConfig::default()
    };
    let files = SessionFiles::new(std::env::temp_dir(), FileNames::default(), None);
    Session::with_mode(config, Mode::Profile, files, Arc::new(InlineHost)).unwrap()
}

fn criterion_benchmark(c: &mut Criterion) {
    let mut group = c.benchmark_group("callbacks");
    let block = counting_session(Granularity::Block);
    group.bench_function("on_block", |b| {
        b.iter(|| block.on_block(black_box(0), black_box(5)).unwrap())
    });

    let instruction = counting_session(Granularity::Instruction);
    let site = InstrumentedInstruction {
        static_index: 1,
        address: 0x1000,
        disassembly: "add rax, rbx".to_string(),
        operands: vec![Operand::register(OperandKind::Destination, "rax", 8, 0)],
    };
    let mut state = NoAccess;
    group.bench_function("on_instruction", |b| {
        b.iter(|| instruction.on_instruction(black_box(0), &site, &mut state).unwrap())
    });
    group.finish();

    // Profiling runs of a four thread victim, shared vs per-thread counters
    let program = VictimProgram::from_json5(VICTIM).unwrap();
    let mut group = c.benchmark_group("victim_profile");
    group.sample_size(10);
    for variant in [Variant::Threaded, Variant::SharedAtomic] {
        for granularity in [Granularity::Block, Granularity::Instruction] {
            let id = BenchmarkId::new(variant.to_string(), format!("{:?}", granularity));
            group.bench_with_input(id, &granularity, |b, &granularity| {
                b.iter(|| {
                    let workdir = tempfile::tempdir().unwrap();
                    let options = RunOptions {
                        session: SessionConfig {
                            variant,
                            granularity,
                            ..SessionConfig::default()
                        },
                        workdir: workdir.path().to_path_buf(),
                        names: FileNames::default(),
                    };
                    Runner::new(&program, options, Arc::new(InlineHost))
                        .run()
                        .unwrap()
                })
            });
        }
    }
    group.finish();
}

/// Never reached in profile mode, the session does not touch operands.
struct NoAccess;

impl OperandAccess for NoAccess {
    fn read(&mut self, _operand: &Operand) -> Result<Vec<u8>, String> {
        Err("unexpected read".to_string())
    }

    fn write(&mut self, _operand: &Operand, _bytes: &[u8]) -> Result<(), String> {
        Err("unexpected write".to_string())
    }
}

criterion_group!(benches, criterion_benchmark);
criterion_main!(benches);
