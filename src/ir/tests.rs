use super::*;
use crate::error::DefinitionError;

fn x() -> Var {
    Var::new("x")
}

fn y() -> Var {
    Var::new("y")
}

#[test]
fn test_func_get_or_create() {
    let mut p = Pipeline::new();
    let a = p.func("blur");
    let b = p.func("blur");
    let c = p.anon();
    assert_eq!(a, b);
    assert_ne!(a, c);
    assert_eq!(p.name(a), "blur");
    assert_eq!(p.name(c), "f0");
}

#[test]
fn test_anon_skips_taken_names() {
    let mut p = Pipeline::new();
    p.func("f0");
    let f = p.anon();
    assert_eq!(p.name(f), "f1");
}

#[test]
fn test_gather_definition() {
    let mut p = Pipeline::new();
    let f = p.func("f");
    p.define(f, [x(), y()], &x() + &y()).unwrap();
    let def = p.definition(f);
    assert_eq!(def.args, vec![x(), y()]);
    assert_eq!(def.ty, Some(Type::i32()));
    assert!(def.updates.is_empty());
    assert!(def.shape.is_empty());
}

#[test]
fn test_second_gather_overwrites() {
    let mut p = Pipeline::new();
    let f = p.func("f");
    p.define(f, [x()], Expr::from(&x())).unwrap();
    p.define(f, [x()], Expr::from(&x()) * 2.0f32).unwrap();
    assert_eq!(p.definition(f).ty, Some(Type::f32()));
}

#[test]
fn test_tuple_gets_implicit_arg() {
    let mut p = Pipeline::new();
    let f = p.func("rgb");
    p.define(f, [x()], Expr::tuple([&x() + 1, &x() + 2, &x() + 3]))
        .unwrap();
    let def = p.definition(f);
    assert_eq!(def.args, vec![x(), Var::implicit(0)]);
    assert_eq!(def.shape, vec![3]);
    assert_eq!(def.implicit_count(), 1);
}

#[test]
fn test_under_applied_call_fills_implicit_args() {
    let mut p = Pipeline::new();
    let g = p.func("g");
    p.define(g, [x(), y()], &x() * &y()).unwrap();
    let f = p.func("f");
    p.define(f, [x()], g.at([&x()]) + 1).unwrap();
    let def = p.definition(f);
    assert_eq!(def.args, vec![x(), Var::implicit(0)]);
    match def.body.as_ref().unwrap() {
        Expr::Binary(BinOp::Add, call, _) => {
            assert_eq!(**call, g.at([Expr::from(&x()), Expr::Var(Var::implicit(0))]));
        }
        other => panic!("unexpected body {:?}", other),
    }
}

#[test]
fn test_image_args_cast_to_i32() {
    let mut p = Pipeline::new();
    let input = ImageParam::new("input", Type::UInt(8), 1);
    let f = p.func("f");
    p.define(f, [x()], input.at([input.at([Expr::from(&x())])]))
        .unwrap();
    let body = p.definition(f).body.clone().unwrap();
    match body {
        Expr::Load(_, args) => assert!(matches!(args[0], Expr::Cast(t, _) if t == Type::i32())),
        other => panic!("unexpected body {:?}", other),
    }
}

#[test]
fn test_implicit_mismatch() {
    let mut p = Pipeline::new();
    let g = p.func("g");
    p.define(g, [x(), y()], &x() + &y()).unwrap();
    let h = p.func("h");
    p.define(h, [x(), y(), Var::new("z")], Expr::from(&x())).unwrap();
    let f = p.func("f");
    let err = p.define(f, [x()], g.at([&x()]) + h.at([&x()])).unwrap_err();
    assert_eq!(
        err,
        DefinitionError::ImplicitMismatch {
            func: "f".to_string(),
            left: 1,
            right: 2,
        }
    );
}

#[test]
fn test_duplicate_var() {
    let mut p = Pipeline::new();
    let f = p.func("f");
    let err = p.define(f, [x(), x()], Expr::int(1)).unwrap_err();
    assert!(matches!(err, DefinitionError::DuplicateVar { ref var, .. } if var == "x"));
}

#[test]
fn test_call_to_undefined() {
    let mut p = Pipeline::new();
    let g = p.func("g");
    let f = p.func("f");
    let err = p.define(f, [x()], g.at([&x()])).unwrap_err();
    assert_eq!(
        err,
        DefinitionError::CallToUndefined {
            func: "f".to_string(),
            callee: "g".to_string(),
        }
    );
}

#[test]
fn test_pure_self_reference() {
    let mut p = Pipeline::new();
    let f = p.func("f");
    p.define(f, [x()], Expr::from(&x())).unwrap();
    let err = p.define(f, [x()], f.at([&x()]) + 1).unwrap_err();
    assert!(matches!(err, DefinitionError::SelfReference { .. }));
}

#[test]
fn test_arity_mismatch() {
    let mut p = Pipeline::new();
    let g = p.func("g");
    p.define(g, [x()], Expr::from(&x())).unwrap();
    let f = p.func("f");
    let err = p.define(f, [x()], g.at([&x(), &x()])).unwrap_err();
    assert_eq!(
        err,
        DefinitionError::ArityMismatch {
            func: "g".to_string(),
            expected: 1,
            found: 2,
        }
    );
}

#[test]
fn test_scatter_without_gather() {
    let mut p = Pipeline::new();
    let f = p.func("f");
    let err = p.define(f, [Expr::int(0)], 1).unwrap_err();
    assert!(matches!(err, DefinitionError::ScatterWithoutGather { .. }));
}

#[test]
fn test_scatter_appends_clause() {
    let mut p = Pipeline::new();
    let f = p.func("f");
    let r = p.rdom(vec![(0, 10), (0, 4)]);
    p.define(f, [x()], Expr::int(0)).unwrap();
    p.define(f, [r.x()], f.at([r.x()]) + r.y()).unwrap();
    let def = p.definition(f);
    assert_eq!(def.updates.len(), 1);
    let clause = &def.updates[0];
    assert_eq!(clause.rvars, vec![Var::new("r0.y"), Var::new("r0.x")]);
    assert_eq!(clause.rdom.as_ref().map(|r| r.name()), Some("r0"));
}

#[test]
fn test_update_handle_shared() {
    let mut p = Pipeline::new();
    let f = p.func("f");
    p.define(f, [x()], Expr::int(0)).unwrap();
    assert!(matches!(
        p.update(f),
        Err(DefinitionError::NoUpdate { ref func }) if func == "f"
    ));
    p.define(f, [Expr::int(3)], 1).unwrap();
    let u = p.update(f).unwrap();
    p.define(f, [Expr::int(4)], 2).unwrap();
    assert_eq!(p.update(f).unwrap(), u);
    assert_eq!(p.name(u), "p0");
    assert_eq!(p.definition(u).owner, Some(f));
    assert_eq!(p.definition(f).updates.len(), 2);
}

#[test]
fn test_multiple_rdoms() {
    let mut p = Pipeline::new();
    let f = p.func("f");
    p.define(f, [x()], Expr::int(0)).unwrap();
    let r = p.rdom(vec![(0, 3)]);
    let s = p.rdom(vec![(0, 3)]);
    let err = p.define(f, [r.x()], r.x() + s.x()).unwrap_err();
    assert_eq!(
        err,
        DefinitionError::MultipleRDoms {
            func: "f".to_string(),
            first: "r0".to_string(),
            second: "r1".to_string(),
        }
    );
}

#[test]
fn test_redefine_after_update() {
    let mut p = Pipeline::new();
    let f = p.func("f");
    p.define(f, [x()], Expr::int(0)).unwrap();
    p.define(f, [Expr::int(0)], 1).unwrap();
    let err = p.define(f, [x()], Expr::int(2)).unwrap_err();
    assert!(matches!(err, DefinitionError::RedefinedAfterUpdate { .. }));
}

#[test]
fn test_add_assign_synthesizes_gather() {
    let mut p = Pipeline::new();
    let input = ImageParam::new("input", Type::UInt(8), 1);
    let r = p.rdom(vec![(0, 10)]);
    let hist = p.func("hist");
    p.add_assign(hist, [input.at([r.x()])], 1).unwrap();
    let def = p.definition(hist);
    assert_eq!(def.args, vec![Var::new("_0")]);
    assert_eq!(def.body, Some(Expr::int(0)));
    assert_eq!(def.ty, Some(Type::i32()));
    assert_eq!(def.updates.len(), 1);
}

#[test]
fn test_add_assign_with_pure_args_still_updates() {
    let mut p = Pipeline::new();
    let g = p.func("g");
    p.define(g, [x()], &x() * 2.0f32).unwrap();
    let f = p.func("f");
    p.add_assign(f, [&x()], g.at([&x()])).unwrap();
    let def = p.definition(f);
    assert_eq!(def.args, vec![x()]);
    assert_eq!(def.body, Some(Expr::float(0.0)));
    assert_eq!(def.updates.len(), 1);
    assert_eq!(def.updates[0].args, vec![Expr::from(&x())]);
}

#[test]
fn test_mul_assign_identity_is_one() {
    let mut p = Pipeline::new();
    let r = p.rdom(vec![(1, 5)]);
    let f = p.func("fact");
    p.mul_assign(f, [Expr::int(0)], r.x()).unwrap();
    let def = p.definition(f);
    assert_eq!(def.body, Some(Expr::int(1)));
    match &def.updates[0].body {
        Expr::Binary(op, _, _) => assert_eq!(*op, BinOp::Mul),
        other => panic!("unexpected update body {:?}", other),
    }
}

#[test]
fn test_add_assign_broadcasts_tuple_init() {
    let mut p = Pipeline::new();
    let r = p.rdom(vec![(0, 4)]);
    let f = p.func("acc");
    p.add_assign(f, [Expr::int(0)], Expr::tuple([Expr::from(r.x()), r.x() * 2]))
        .unwrap();
    let def = p.definition(f);
    assert_eq!(def.args.len(), 2);
    assert_eq!(def.shape, vec![2]);
    assert_eq!(def.body, Some(Expr::broadcast(Expr::int(0), 1)));
    assert_eq!(def.updates[0].args.len(), 2);
}

#[test]
fn test_callees_and_reachable() {
    let mut p = Pipeline::new();
    let a = p.func("a");
    let b = p.func("b");
    let c = p.func("c");
    let unrelated = p.func("unrelated");
    p.define(a, [x()], Expr::from(&x())).unwrap();
    p.define(b, [x()], a.at([&x()]) + 1).unwrap();
    p.define(c, [x()], b.at([&x()]) + a.at([&x()])).unwrap();
    p.define(unrelated, [x()], Expr::int(7)).unwrap();
    assert_eq!(p.callees(c), vec![b, a]);
    let reach = p.reachable(c);
    assert_eq!(reach.len(), 2);
    assert!(reach.contains(&a) && reach.contains(&b));
    assert!(!reach.contains(&unrelated));
}

#[test]
fn test_inputs_first_reference_order() {
    let mut p = Pipeline::new();
    let lut = ImageParam::new("lut", Type::f32(), 1);
    let input = ImageParam::new("input", Type::f32(), 1);
    let gain = Param::new("gain", Type::f32());
    let g = p.func("g");
    p.define(g, [x()], lut.at([&x()]) * &gain).unwrap();
    let f = p.func("f");
    p.define(f, [x()], input.at([&x()]) + g.at([&x()]) + lut.at([&x()]))
        .unwrap();
    let inputs = p.inputs(f);
    let names: Vec<&str> = inputs.image_params.iter().map(|i| i.name()).collect();
    assert_eq!(names, vec!["input", "lut"]);
    assert_eq!(inputs.params.len(), 1);
    assert!(inputs.images.is_empty());
}

#[test]
fn test_listing() {
    let mut p = Pipeline::new();
    let input = ImageParam::new("input", Type::UInt(8), 1);
    let r = p.rdom(vec![(0, 10)]);
    let blur = p.func("blur");
    p.define(blur, [x()], (input.at([&x()]) + input.at([&x() + 1])) / 2)
        .unwrap();
    let hist = p.func("hist");
    p.add_assign(hist, [input.at([r.x()])], 1).unwrap();
    insta::assert_snapshot!(p.to_string().trim_end(), @r###"
    blur(x): i32 = (cast<i32>((input(x) + input((x + 1)))) / 2)
    hist(_0): i32 = 0
      update [0] hist(cast<i32>(input(r0.x))) = (hist(cast<i32>(input(r0.x))) + 1) for r0.x in [0, +10)
    "###);
}

#[test]
fn test_math_coerces_to_float() {
    let mut p = Pipeline::new();
    let f = p.func("gamma");
    p.define(f, [x()], Expr::from(&x()).pow(0.5f32).sqrt())
        .unwrap();
    assert_eq!(p.definition(f).ty, Some(Type::f32()));
    insta::assert_snapshot!(p.to_string().trim_end(), @"gamma(x): f32 = sqrt(pow(cast<f32>(x), 0.5))");

    let g = p.func("wide");
    p.define(g, [x()], Expr::from(&x()).pow(2.0f64)).unwrap();
    assert_eq!(p.definition(g).ty, Some(Type::Float(64)));
}

#[test]
fn test_math_arity_checked() {
    let mut p = Pipeline::new();
    let f = p.func("f");
    let err = p
        .define(f, [x()], Expr::Math(MathFn::Pow, vec![Expr::float(1.0)]))
        .unwrap_err();
    assert!(matches!(
        err,
        DefinitionError::ArityMismatch { expected: 2, found: 1, .. }
    ));
}

#[test]
fn test_type_extremes() {
    assert_eq!(Expr::max_value(Type::UInt(8)), Expr::Const(Type::UInt(8), Scalar::UInt(255)));
    assert_eq!(Expr::min_value(Type::Int(16)), Expr::Const(Type::Int(16), Scalar::Int(-32768)));
    assert_eq!(Expr::max_value(Type::i32()), Expr::Const(Type::i32(), Scalar::Int(i32::MAX as i64)));
    assert_eq!(Expr::min_value(Type::f32()), Expr::Const(Type::f32(), Scalar::Float(f32::MIN as f64)));
}
