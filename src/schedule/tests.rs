use super::archive::ScheduleArchive;
use super::*;
use crate::error::ScheduleErrorKind;
use crate::ir::{Expr, Type};

fn v(name: &str) -> Var {
    Var::new(name)
}

fn pipeline_2d() -> (Pipeline, Func) {
    let mut p = Pipeline::new();
    let f = p.func("f");
    p.define(f, [v("x"), v("y")], v("x") + v("y")).unwrap();
    (p, f)
}

fn listed(p: &Pipeline, f: Func) -> String {
    p.definition(f)
        .directives
        .iter()
        .map(|d| d.to_string())
        .collect::<Vec<_>>()
        .join("\n")
}

fn dim_names(s: &FuncSchedule) -> Vec<&str> {
    s.dims.iter().map(|d| d.var.name()).collect()
}

#[test]
fn test_factor_one_records_nothing() {
    let (mut p, f) = pipeline_2d();
    p.schedule(f).vectorize_by(&v("x"), 1).unroll_by(&v("y"), 1);
    assert!(p.definition(f).directives.is_empty());
}

#[test]
fn test_vectorize_by_expands() {
    let (mut p, f) = pipeline_2d();
    p.schedule(f).vectorize_by(&v("x"), 4);
    insta::assert_snapshot!(listed(&p, f), @r###"
    split(x, x, x_0, 4)
    vectorize(x_0)
    "###);
}

#[test]
fn test_unroll_by_expands() {
    let (mut p, f) = pipeline_2d();
    p.schedule(f).unroll_by(&v("y"), 2);
    let d = &p.definition(f).directives;
    assert_eq!(d.len(), 2);
    assert_eq!(d[1], Directive::Unroll(v("y_0")));
}

#[test]
fn test_tile_is_split_split_transpose() {
    let (mut p, f) = pipeline_2d();
    p.schedule(f)
        .tile(&v("x"), &v("y"), &v("xi"), &v("yi"), 8, 4);
    let (mut q, g) = pipeline_2d();
    q.schedule(g)
        .split(&v("x"), &v("x"), &v("xi"), 8)
        .split(&v("y"), &v("y"), &v("yi"), 4)
        .transpose(&v("x"), &v("yi"));
    assert_eq!(p.definition(f).directives, q.definition(g).directives);
}

#[test]
fn test_tile_with_outer() {
    let (mut p, f) = pipeline_2d();
    p.schedule(f).tile_with_outer(
        &v("x"),
        &v("y"),
        &v("xo"),
        &v("yo"),
        &v("xi"),
        &v("yi"),
        16,
        16,
    );
    insta::assert_snapshot!(listed(&p, f), @r###"
    split(x, xo, xi, 16)
    split(y, yo, yi, 16)
    transpose(xo, yi)
    "###);
}

#[test]
fn test_rename_is_unit_split() {
    let (mut p, f) = pipeline_2d();
    p.schedule(f).rename(&v("x"), &v("col"));
    assert_eq!(
        p.definition(f).directives,
        vec![Directive::Split {
            old: v("x"),
            outer: v("col"),
            inner: v("x_0"),
            factor: 1,
        }]
    );
}

#[test]
fn test_cuda_directives() {
    let (mut p, f) = pipeline_2d();
    p.schedule(f).cuda(&v("y"), &v("x"));
    insta::assert_snapshot!(listed(&p, f), @r###"
    split(y, blockidx, y_0, 1)
    split(x, threadidx, x_1, 1)
    parallel(blockidx)
    parallel(threadidx)
    "###);
}

#[test]
fn test_cuda_tile_2d_directives() {
    let (mut p, f) = pipeline_2d();
    p.schedule(f).cuda_tile_2d(&v("x"), &v("y"), 16, 8);
    insta::assert_snapshot!(listed(&p, f), @r###"
    split(x, blockidx, threadidx, 16)
    split(y, blockidy, threadidy, 8)
    transpose(blockidx, threadidy)
    parallel(blockidx)
    parallel(threadidx)
    parallel(blockidy)
    parallel(threadidy)
    "###);
}

#[test]
fn test_replay_tile_loop_order() {
    let (mut p, f) = pipeline_2d();
    p.schedule(f)
        .tile(&v("x"), &v("y"), &v("xi"), &v("yi"), 8, 4)
        .parallel(&v("y"));
    let state = replay(&p, f).unwrap();
    let s = state.get("f").unwrap();
    assert_eq!(dim_names(s), vec!["xi", "yi", "x", "y"]);
    assert_eq!(s.kind(&v("y")), Some(LoopKind::Parallel));
    assert_eq!(s.store, StoreLevel::Root);
    assert_eq!(s.splits.len(), 2);
}

#[test]
fn test_replay_cuda_tile_2d() {
    let (mut p, f) = pipeline_2d();
    p.schedule(f).cuda_tile_2d(&v("x"), &v("y"), 16, 8);
    let state = replay(&p, f).unwrap();
    let s = state.get("f").unwrap();
    assert_eq!(
        dim_names(s),
        vec!["threadidx", "threadidy", "blockidx", "blockidy"]
    );
    assert!(s.dims.iter().all(|d| d.kind == LoopKind::Parallel));
}

#[test]
fn test_replay_unknown_var() {
    let (mut p, f) = pipeline_2d();
    p.schedule(f).parallel(&v("y")).vectorize(&v("q"));
    let err = replay(&p, f).unwrap_err();
    assert_eq!(err.func, "f");
    assert_eq!(err.index, 1);
    assert_eq!(err.kind, ScheduleErrorKind::UnknownVar("q".to_string()));
}

#[test]
fn test_replay_bad_factor() {
    let (mut p, f) = pipeline_2d();
    p.schedule(f).vectorize_by(&v("x"), 0);
    let err = replay(&p, f).unwrap_err();
    assert_eq!(err.index, 0);
    assert_eq!(err.kind, ScheduleErrorKind::BadFactor(0));
}

#[test]
fn test_replay_duplicate_name() {
    let (mut p, f) = pipeline_2d();
    p.schedule(f).split(&v("x"), &v("x"), &v("y"), 2);
    let err = replay(&p, f).unwrap_err();
    assert_eq!(err.kind, ScheduleErrorKind::DuplicateVar("y".to_string()));
}

#[test]
fn test_tuple_fixup_pulls_tuple_dim_inside() {
    let mut p = Pipeline::new();
    let f = p.func("rgb");
    p.define(
        f,
        [v("x"), v("y")],
        Expr::tuple([v("x") + 0, v("y") + 0, v("x") + v("y")]),
    )
    .unwrap();
    p.schedule(f).parallel(&v("y"));
    let state = replay(&p, f).unwrap();
    let s = state.get("rgb").unwrap();
    assert_eq!(dim_names(s), vec!["iv0", "x", "y"]);
    assert_eq!(s.kind(&v("iv0")), Some(LoopKind::Unrolled));
    assert_eq!(s.bound(&v("iv0")), Some((0, 3)));
}

#[test]
fn test_tuple_target_always_fixed_up() {
    let mut p = Pipeline::new();
    let f = p.func("pair");
    p.define(f, [v("x")], Expr::tuple([1, 2])).unwrap();
    let state = replay(&p, f).unwrap();
    let s = state.get("pair").unwrap();
    assert_eq!(dim_names(s), vec!["iv0", "x"]);
    assert_eq!(s.kind(&v("iv0")), Some(LoopKind::Unrolled));
    assert_eq!(s.bound(&v("iv0")), Some((0, 2)));
}

#[test]
fn test_unscheduled_tuple_callee_has_no_fixup() {
    let mut p = Pipeline::new();
    let pair = p.func("pair");
    p.define(pair, [v("x")], Expr::tuple([1, 2])).unwrap();
    let f = p.func("f");
    p.define(f, [v("x")], pair.at([Expr::from(v("x")), Expr::int(1)])).unwrap();
    let state = replay(&p, f).unwrap();
    let s = state.get("pair").unwrap();
    assert_eq!(dim_names(s), vec!["x", "iv0"]);
    assert_eq!(s.kind(&v("iv0")), Some(LoopKind::Serial));
    assert!(s.bounds.is_empty());
}

#[test]
fn test_chunk_names_caller_loop() {
    let mut p = Pipeline::new();
    let g = p.func("g");
    p.define(g, [v("x")], v("x") * 2).unwrap();
    let f = p.func("f");
    p.define(f, [v("x")], g.at([v("x")]) + 1).unwrap();
    p.schedule(f).split(&v("x"), &v("xo"), &v("xi"), 4);
    p.schedule(g).chunk(&v("xo"));
    let state = replay(&p, f).unwrap();
    assert_eq!(state.get("g").unwrap().store, StoreLevel::Chunk(v("xo")));
}

#[test]
fn test_chunk_unknown_loop() {
    let mut p = Pipeline::new();
    let g = p.func("g");
    p.define(g, [v("x")], v("x") * 2).unwrap();
    let f = p.func("f");
    p.define(f, [v("x")], g.at([v("x")]) + 1).unwrap();
    p.schedule(g).vectorize_by(&v("x"), 4).chunk(&v("no_such_loop"));
    let err = replay(&p, f).unwrap_err();
    assert_eq!(err.func, "g");
    assert_eq!(err.index, 2);
    assert_eq!(err.directive, "chunk(no_such_loop)");
    assert_eq!(
        err.kind,
        ScheduleErrorKind::UnknownChunkLoop("no_such_loop".to_string())
    );
}

#[test]
fn test_chunk_on_own_loop_is_rejected() {
    let mut p = Pipeline::new();
    let g = p.func("g");
    p.define(g, [v("x"), v("y")], v("x") + v("y")).unwrap();
    let f = p.func("f");
    p.define(f, [v("x")], g.at([Expr::from(v("x")), Expr::int(0)])).unwrap();
    p.schedule(g).chunk(&v("y"));
    let err = replay(&p, f).unwrap_err();
    assert_eq!(err.kind, ScheduleErrorKind::UnknownChunkLoop("y".to_string()));
}

#[test]
fn test_unreachable_not_replayed() {
    let (mut p, f) = pipeline_2d();
    let other = p.func("other");
    p.define(other, [v("x")], Expr::int(1)).unwrap();
    p.schedule(other).vectorize(&v("nope"));
    let state = replay(&p, f).unwrap();
    assert!(state.get("other").is_none());
}

#[test]
fn test_reachable_replayed_once_not_root() {
    let mut p = Pipeline::new();
    let g = p.func("g");
    p.define(g, [v("x")], v("x") * 2).unwrap();
    let f = p.func("f");
    p.define(f, [v("x")], g.at([v("x")]) + g.at([v("x") + 1]))
        .unwrap();
    p.schedule(g).root().vectorize_by(&v("x"), 4);
    let state = replay(&p, f).unwrap();
    assert_eq!(state.funcs.len(), 2);
    assert_eq!(state.get("g").unwrap().store, StoreLevel::Root);
    assert_eq!(dim_names(state.get("g").unwrap()), vec!["x_0", "x"]);
}

#[test]
fn test_update_handle_directives() {
    let mut p = Pipeline::new();
    let input = crate::ir::ImageParam::new("input", Type::f32(), 1);
    let r = p.rdom(vec![(0, 10)]);
    let f = p.func("sum");
    p.add_assign(f, [v("x")], input.at([v("x") + r.x()])).unwrap();
    let u = p.update(f).unwrap();
    p.schedule(u).parallel(&v("x"));
    let state = replay(&p, f).unwrap();
    let s = state.get(p.name(u)).unwrap();
    assert_eq!(dim_names(s), vec!["r0.x", "x"]);
    assert_eq!(s.kind(&v("x")), Some(LoopKind::Parallel));
}

#[test]
fn test_random_is_deterministic() {
    let (mut p, f) = pipeline_2d();
    p.schedule(f).random(7).random(12345);
    let a = replay(&p, f).unwrap();
    let b = replay(&p, f).unwrap();
    assert_eq!(a, b);
    assert_eq!(a.get("f").unwrap().seeds, vec![7, 12345]);
}

#[test]
fn test_mutation_invalidates() {
    let (mut p, f) = pipeline_2d();
    p.compiled.insert(f, crate::api::Compiled::placeholder());
    p.schedule(f).parallel(&v("y"));
    assert!(p.compiled.is_empty());
}

#[test]
fn test_archive_round_trip() {
    let (mut p, f) = pipeline_2d();
    p.schedule(f)
        .tile(&v("x"), &v("y"), &v("xi"), &v("yi"), 8, 4)
        .parallel(&v("y"))
        .random(3);
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("f.schedule");
    ScheduleArchive::capture(&p).save(&path).unwrap();

    let (mut q, g) = pipeline_2d();
    ScheduleArchive::load(&path).unwrap().apply(&mut q).unwrap();
    assert_eq!(p.definition(f).directives, q.definition(g).directives);
}

#[test]
fn test_archive_unknown_func() {
    let (mut p, f) = pipeline_2d();
    p.schedule(f).root();
    let archive = ScheduleArchive::capture(&p);
    let mut q = Pipeline::new();
    let err = archive.apply(&mut q).unwrap_err();
    assert!(matches!(err, archive::ArchiveError::UnknownFunc(ref n) if n == "f"));
}
