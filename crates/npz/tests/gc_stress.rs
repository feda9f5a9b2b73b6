//! Collector stress: with the stress knob on, a collection runs at every
//! collection point, so any missed root or barrier shows up as a wrong
//! result or a use of a swept slot.

use npz::{CollectStringPrint, Vm};

fn run_stressed(source: &str) -> String {
    let mut writer = CollectStringPrint::new();
    {
        let mut vm = Vm::new(&mut writer);
        vm.heap_mut().set_gc_stress(true);
        vm.interpret(source, Some("stress")).expect("stressed run failed");
    }
    writer.into_output()
}

#[test]
fn string_churn_survives_constant_collection() {
    let source = "var s = \"\"; \
                  for (var i = 0; i < 50; i += 1) { s = s + \"x\"; } \
                  println(length(s));";
    assert_eq!(run_stressed(source), "50\n");
}

#[test]
fn closures_and_upvalues_survive_constant_collection() {
    let source = "fn adder(n) { fn add(m) { return n + m; } return add; } \
                  var total = 0; \
                  for (var i = 0; i < 20; i += 1) { total += adder(i)(i); } \
                  println(total);";
    assert_eq!(run_stressed(source), "380\n");
}

#[test]
fn instances_survive_constant_collection() {
    let source = "class Node { build(v){ this.v = v; this.next = null; } } \
                  var head = null; \
                  for (var i = 0; i < 25; i += 1) { \
                    var n = new Node(i); \
                    n.next = head; \
                    head = n; \
                  } \
                  var sum = 0; \
                  while (head != null) { sum += head.v; head = head.next; } \
                  println(sum);";
    assert_eq!(run_stressed(source), "300\n");
}

#[test]
fn cyclic_object_graphs_are_collected_not_leaked() {
    // Class -> method closure -> upvalue -> class cycles must neither keep
    // the program from completing nor corrupt live data.
    let source = "var results = []; \
                  for (var i = 0; i < 10; i += 1) { \
                    var box = [i]; \
                    fn read() { return box[0]; } \
                    append(results, read()); \
                  } \
                  println(length(results));";
    assert_eq!(run_stressed(source), "10\n");
}

#[test]
fn dead_garbage_is_actually_reclaimed() {
    let mut writer = CollectStringPrint::new();
    let mut vm = Vm::new(&mut writer);
    // Make plenty of unreachable lists, then force a collection.
    vm.interpret(
        "for (var i = 0; i < 100; i += 1) { var tmp = [1, 2, 3] + [4]; } println(\"done\");",
        Some("garbage"),
    )
    .expect("run failed");
    vm.collect_garbage();
    let live_after_first = vm.heap_mut().bytes_allocated();
    vm.collect_garbage();
    // A second collection finds nothing new to free.
    assert_eq!(vm.heap_mut().bytes_allocated(), live_after_first);
    drop(vm);
    assert_eq!(writer.output(), "done\n");
}

#[test]
fn map_entries_are_traced_through_the_foreign_capability() {
    let source = "import npmap; \
                  var m = npmap.map(); \
                  for (var i = 0; i < 20; i += 1) { \
                    npmap.put(m, \"key\" + asString(i), [i, i]); \
                  } \
                  var sum = 0; \
                  for (var i = 0; i < 20; i += 1) { \
                    sum += npmap.get(m, \"key\" + asString(i))[0]; \
                  } \
                  println(sum);";
    assert_eq!(run_stressed(source), "190\n");
}
