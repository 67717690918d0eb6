use criterion::{black_box, criterion_group, criterion_main, Criterion};
use syntaxflow::memory::MemoryProgram;
use syntaxflow::*;

fn program(width: usize) -> MemoryProgram {
    let prog = MemoryProgram::new();
    for i in 0..width {
        let source = prog.add(&format!("source{}", i), IrOpcode::Param);
        let call = prog.add_with_text(&format!("exec{}", i), "exec(cmd)", IrOpcode::Call);
        let obj = prog.add(&format!("obj{}", i), IrOpcode::Make);
        prog.add_field(&obj, "inner", &format!("inner{}", i), IrOpcode::Const);
        prog.link_use(&source, &call);
    }
    prog
}

fn query() -> Query {
    Query::new()
        .chain(ChainBuilder::search("source*").bind("sources"))
        .chain(
            ChainBuilder::variable("sources")
                .navigate_with(NavigationKind::BottomUsers, &[("depth", "3")])
                .filter(ConditionExpr::have(&["exec"]).and(ConditionExpr::opcode(&["call"])))
                .bind("sinks"),
        )
        .chain(ChainBuilder::search("obj*").filter(ConditionExpr::Query(vec![ChainElement::Member("inner".into())])).bind("objs"))
        .alert("sinks")
}

fn bench_compile_execute(c: &mut Criterion) {
    let engine = SyntaxFlowEngine::new();
    let query = query();
    let prog = program(200);
    let input = prog.values();

    c.bench_function("compile", |b| {
        b.iter(|| {
            let _ = engine.compile(black_box(&query));
        })
    });
    let compiled = engine.compile(&query).unwrap();
    c.bench_function("execute", |b| {
        b.iter(|| {
            let _ = compiled.execute(black_box(input.clone()), FrameConfig::default());
        })
    });
    c.bench_function("execute_diagnostics", |b| {
        b.iter(|| {
            let _ = compiled.execute(black_box(input.clone()), FrameConfig::builder().diagnostics(true).build());
        })
    });
}

criterion_group!(benches, bench_compile_execute);
criterion_main!(benches);
