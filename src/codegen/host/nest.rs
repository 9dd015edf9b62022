//! The target's loop nest, rebuilt from its replayed schedule.
//!
//! Every loop variable gets a slot. The target's own arguments take the
//! first slots; each split retires its old slot and adds two new ones, so a
//! name reused by a later split (`split(x, x, xi, 4)`) still refers to a
//! distinct loop.

use crate::error::CompileError;
use crate::ir::expr::Var;
use crate::runtime::buffer::RawBuffer;
use crate::schedule::{FuncSchedule, LoopKind};

#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct Loop {
    pub slot: usize,
    pub var: Var,
    pub kind: LoopKind,
}

/// `old = min(old) + outer * factor + inner`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct SlotSplit {
    pub old: usize,
    pub outer: usize,
    pub inner: usize,
    pub factor: i32,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct Nest {
    /// Number of slots that are arguments of the target.
    pub args: usize,
    pub slots: usize,
    pub splits: Vec<SlotSplit>,
    /// Innermost first.
    pub loops: Vec<Loop>,
    pub bounds: Vec<(usize, i32, i32)>,
}

fn inconsistent(message: String) -> CompileError {
    CompileError::Backend {
        backend: "host".to_string(),
        message,
    }
}

impl Nest {
    pub fn build(args: &[Var], sched: &FuncSchedule) -> Result<Nest, CompileError> {
        let mut live: Vec<(Var, usize)> = args.iter().cloned().zip(0..).collect();
        let mut slots = args.len();
        let mut splits = Vec::with_capacity(sched.splits.len());

        let take = |live: &mut Vec<(Var, usize)>, v: &Var| -> Result<usize, CompileError> {
            let at = live
                .iter()
                .position(|(name, _)| name == v)
                .ok_or_else(|| inconsistent(format!("split of unknown loop '{}'", v)))?;
            Ok(live.remove(at).1)
        };
        for split in &sched.splits {
            let old = take(&mut live, &split.old)?;
            let (outer, inner) = (slots, slots + 1);
            slots += 2;
            live.push((split.outer.clone(), outer));
            live.push((split.inner.clone(), inner));
            splits.push(SlotSplit {
                old,
                outer,
                inner,
                factor: split.factor,
            });
        }

        let find = |v: &Var| live.iter().find(|(name, _)| name == v).map(|&(_, slot)| slot);
        let loops = sched
            .dims
            .iter()
            .map(|d| {
                find(&d.var)
                    .map(|slot| Loop {
                        slot,
                        var: d.var.clone(),
                        kind: d.kind,
                    })
                    .ok_or_else(|| inconsistent(format!("no loop for dimension '{}'", d.var)))
            })
            .collect::<Result<Vec<_>, _>>()?;

        let bounds = sched
            .bounds
            .iter()
            .filter_map(|(v, min, extent)| {
                let slot = args.iter().position(|a| a == v).or_else(|| find(v))?;
                Some((slot, *min, *extent))
            })
            .collect();

        Ok(Nest {
            args: args.len(),
            slots,
            splits,
            loops,
            bounds,
        })
    }

    /// `(min, extent)` of every slot when computing over `output`.
    pub fn ranges(&self, output: &RawBuffer) -> Vec<(i32, i32)> {
        let mut ranges = vec![(0, 0); self.slots];
        for (i, range) in ranges.iter_mut().take(self.args).enumerate() {
            *range = (output.min[i], output.extent[i]);
        }
        let clip = |ranges: &mut Vec<(i32, i32)>, slot: usize, min: i32, extent: i32| {
            let (m, e) = ranges[slot];
            let lo = m.max(min);
            let hi = (m + e).min(min + extent);
            ranges[slot] = (lo, (hi - lo).max(0));
        };
        for &(slot, min, extent) in self.bounds.iter().filter(|b| b.0 < self.args) {
            clip(&mut ranges, slot, min, extent);
        }
        for s in &self.splits {
            let (_, extent) = ranges[s.old];
            let outer = if extent <= 0 { 0 } else { (extent + s.factor - 1) / s.factor };
            ranges[s.outer] = (0, outer);
            ranges[s.inner] = (0, s.factor);
        }
        for &(slot, min, extent) in self.bounds.iter().filter(|b| b.0 >= self.args) {
            clip(&mut ranges, slot, min, extent);
        }
        ranges
    }

    /// Fill in split-away slots from the loop slots. Returns false when the
    /// point falls in the padding of an uneven split.
    pub fn reconstruct(&self, ranges: &[(i32, i32)], vals: &mut [i32]) -> bool {
        for s in self.splits.iter().rev() {
            let (min, extent) = ranges[s.old];
            let v = min + vals[s.outer] * s.factor + vals[s.inner];
            if v >= min + extent {
                return false;
            }
            vals[s.old] = v;
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schedule::Directive;

    fn v(name: &str) -> Var {
        Var::new(name)
    }

    fn output(extents: &[i32]) -> RawBuffer {
        let mut raw = RawBuffer {
            dev: 0,
            host: std::ptr::null_mut(),
            extent: [0; 4],
            stride: [0; 4],
            min: [0; 4],
            elem_size: 4,
            host_dirty: false,
            dev_dirty: false,
        };
        raw.extent[..extents.len()].copy_from_slice(extents);
        raw
    }

    fn schedule(args: &[Var], directives: &[Directive]) -> FuncSchedule {
        let mut sched = FuncSchedule::new(args);
        for d in directives {
            sched.apply(d).unwrap();
        }
        sched
    }

    #[test]
    fn test_split_reuses_name() {
        let args = [v("x")];
        let sched = schedule(
            &args,
            &[Directive::Split {
                old: v("x"),
                outer: v("x"),
                inner: v("xi"),
                factor: 4,
            }],
        );
        let nest = Nest::build(&args, &sched).unwrap();
        assert_eq!(nest.slots, 3);
        assert_eq!(nest.loops.iter().map(|l| l.slot).collect::<Vec<_>>(), vec![2, 1]);

        let ranges = nest.ranges(&output(&[10]));
        assert_eq!(ranges[1], (0, 3));
        assert_eq!(ranges[2], (0, 4));

        let mut vals = vec![0, 2, 1];
        assert!(nest.reconstruct(&ranges, &mut vals));
        assert_eq!(vals[0], 9);
        let mut vals = vec![0, 2, 2];
        assert!(!nest.reconstruct(&ranges, &mut vals));
    }

    #[test]
    fn test_bound_clips_argument() {
        let args = [v("x"), v("iv0")];
        let sched = schedule(
            &args,
            &[Directive::Bound {
                var: v("iv0"),
                min: 0,
                extent: 3,
            }],
        );
        let nest = Nest::build(&args, &sched).unwrap();
        let ranges = nest.ranges(&output(&[5, 4]));
        assert_eq!(ranges, vec![(0, 5), (0, 3)]);
    }

    #[test]
    fn test_nested_splits() {
        let args = [v("x")];
        let sched = schedule(
            &args,
            &[
                Directive::Split {
                    old: v("x"),
                    outer: v("xo"),
                    inner: v("xi"),
                    factor: 8,
                },
                Directive::Split {
                    old: v("xi"),
                    outer: v("xio"),
                    inner: v("xii"),
                    factor: 2,
                },
            ],
        );
        let nest = Nest::build(&args, &sched).unwrap();
        let ranges = nest.ranges(&output(&[20]));
        let mut seen = Vec::new();
        for xo in 0..ranges[1].1 {
            for xio in 0..ranges[3].1 {
                for xii in 0..ranges[4].1 {
                    let mut vals = vec![0; nest.slots];
                    vals[1] = xo;
                    vals[3] = xio;
                    vals[4] = xii;
                    if nest.reconstruct(&ranges, &mut vals) {
                        seen.push(vals[0]);
                    }
                }
            }
        }
        assert_eq!(seen, (0..20).collect::<Vec<_>>());
    }
}
