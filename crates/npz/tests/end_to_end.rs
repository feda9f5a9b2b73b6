//! End-to-end tests: compile and run literal programs, asserting on the
//! collected stdout.

use npz::{CollectStringPrint, InterpretError, Vm};

/// Runs a program and returns everything it printed.
fn run(source: &str) -> String {
    let mut writer = CollectStringPrint::new();
    {
        let mut vm = Vm::new(&mut writer);
        if let Err(err) = vm.interpret(source, Some("test")) {
            panic!("program failed:\n{err}");
        }
    }
    writer.into_output()
}

/// Runs a program expecting a runtime failure, returning the error text.
fn run_expecting_runtime_error(source: &str) -> String {
    let mut writer = CollectStringPrint::new();
    let mut vm = Vm::new(&mut writer);
    match vm.interpret(source, Some("test")) {
        Err(InterpretError::Runtime(exception)) => exception.to_string(),
        Err(InterpretError::Compile(err)) => panic!("expected runtime error, got compile error:\n{err}"),
        Ok(_) => panic!("expected runtime error, program succeeded"),
    }
}

/// Runs a program expecting a compile failure, returning the error text.
fn run_expecting_compile_error(source: &str) -> String {
    let mut writer = CollectStringPrint::new();
    let mut vm = Vm::new(&mut writer);
    match vm.interpret(source, Some("test")) {
        Err(InterpretError::Compile(err)) => err.to_string(),
        Err(InterpretError::Runtime(exception)) => panic!("expected compile error, got runtime error:\n{exception}"),
        Ok(_) => panic!("expected compile error, program succeeded"),
    }
}

#[test]
fn arithmetic_precedence() {
    assert_eq!(run("println(1+2*3);"), "7\n");
}

#[test]
fn string_building_in_a_for_loop() {
    assert_eq!(run("var s=\"a\"; for(var i=0;i<3;i=i+1) s=s+\"b\"; println(s);"), "abbb\n");
}

#[test]
fn closures_share_a_counter() {
    let source = "fn makeCounter(){var n=0; fn inc(){n=n+1; return n;} return inc;} \
                  const c=makeCounter(); println(c()); println(c()); println(c());";
    assert_eq!(run(source), "1\n2\n3\n");
}

#[test]
fn inheritance_and_super_dispatch() {
    let source = "class A { build(x){ this.x=x; } fn get(){ return this.x; } } \
                  class B <- A { fn get(){ return super.get()+1; } } \
                  println((new B(41)).get());";
    assert_eq!(run(source), "42\n");
    // The direct call form must construct too.
    let direct = "class A { build(x){ this.x=x; } fn get(){ return this.x; } } \
                  class B <- A { fn get(){ return super.get()+1; } } \
                  println(B(41).get());";
    assert_eq!(run(direct), "42\n");
}

#[test]
fn list_literals_and_index_assignment() {
    assert_eq!(run("var xs=[3,1,2]; xs[1]=9; println(xs[0]+xs[1]+xs[2]);"), "14\n");
}

#[test]
fn std_library_import() {
    assert_eq!(run("import std; std.println(\"hi\");"), "hi\n");
}

#[test]
fn print_separates_arguments_with_spaces() {
    assert_eq!(run("println(1, \"two\", true, null);"), "1 two true null\n");
}

#[test]
fn if_else_branches() {
    assert_eq!(run("if (1 < 2) println(\"yes\"); else println(\"no\");"), "yes\n");
    assert_eq!(run("if (2 < 1) println(\"yes\"); else println(\"no\");"), "no\n");
}

#[test]
fn logical_operators_short_circuit() {
    assert_eq!(run("println(true && false); println(false || true);"), "false\ntrue\n");
    // The right side must not run when short-circuited.
    assert_eq!(run("fn boom(){ println(\"boom\"); return true; } println(false && boom());"), "false\n");
}

#[test]
fn comparisons_accept_strings() {
    assert_eq!(run("println(\"abc\" < \"abd\"); println(\"b\" >= \"a\");"), "true\ntrue\n");
}

#[test]
fn list_concatenation_builds_a_new_list() {
    let source = "var a=[1,2]; var b=[3]; var c=a+b; println(length(c)); println(c[2]); println(length(a));";
    assert_eq!(run(source), "3\n3\n2\n");
}

#[test]
fn compound_assignment_forms() {
    assert_eq!(run("var x=10; x+=5; x-=3; x*=2; x/=4; println(x);"), "6\n");
}

#[test]
fn compound_assignment_on_properties_and_indexes() {
    let source = "class C { var n = 0; } var c=new C(); c.n += 4; c.n *= 2; println(c.n); \
                  var xs=[1,2]; xs[0] += 9; println(xs[0]);";
    assert_eq!(run(source), "8\n10\n");
}

#[test]
fn while_with_break_and_continue() {
    let source = "var out = \"\"; \
                  for (var i = 0; i < 5; i += 1) { \
                    if (i == 1) continue; \
                    if (i == 4) break; \
                    out += asString(i); \
                  } \
                  println(out);";
    assert_eq!(run(source), "023\n");
}

#[test]
fn nested_loops_break_only_the_inner() {
    let source = "var n = 0; var i = 0; \
                  while (i < 3) { \
                    var j = 0; \
                    while (j < 3) { \
                      j += 1; \
                      if (j == 2) break; \
                      n += 1; \
                    } \
                    i += 1; \
                  } \
                  println(n);";
    assert_eq!(run(source), "3\n");
}

#[test]
fn two_closures_share_one_upvalue() {
    let source = "fn makePair() { \
                    var n = 0; \
                    fn inc() { n += 1; return n; } \
                    fn get() { return n; } \
                    return [inc, get]; \
                  } \
                  var p = makePair(); \
                  p[0](); p[0](); \
                  println(p[1]());";
    assert_eq!(run(source), "2\n");
}

#[test]
fn string_escape_sequences() {
    assert_eq!(run("println(\"a\\tb\");"), "a\tb\n");
    assert_eq!(run("println(\"quote: \\\"x\\\"\");"), "quote: \"x\"\n");
}

#[test]
fn fields_statics_and_access_flags() {
    let source = "class Counter { \
                    var count = 0; \
                    static var total = 0; \
                    const var id = 7; \
                    let secret = 99; \
                    fn bump() { this.count += 1; Counter.total += 1; return this.count; } \
                    fn peek() { return this.secret; } \
                  } \
                  var c = new Counter(); \
                  c.bump(); c.bump(); \
                  var d = new Counter(); \
                  d.bump(); \
                  println(c.count); \
                  println(d.count); \
                  println(Counter.total); \
                  println(c.id); \
                  println(c.peek());";
    assert_eq!(run(source), "2\n1\n3\n7\n99\n");
}

#[test]
fn constant_attribute_rejects_writes() {
    let err = run_expecting_runtime_error("class C { const var id = 1; } var c = new C(); c.id = 2;");
    assert!(err.contains("constant"), "unexpected error: {err}");
}

#[test]
fn private_field_is_invisible_outside_the_class() {
    let err = run_expecting_runtime_error("class C { let secret = 1; } var c = new C(); println(c.secret);");
    assert!(err.contains("private"), "unexpected error: {err}");
}

#[test]
fn default_string_method() {
    let source = "class P { build(x){ this.x=x; } def string(){ return \"P(\" + asString(this.x) + \")\"; } } \
                  println(new P(3));";
    assert_eq!(run(source), "P(3)\n");
}

#[test]
fn default_eq_method() {
    let source = "class V { build(v){ this.v=v; } def eq(o){ return this.v == o.v; } } \
                  println(new V(1) == new V(1)); \
                  println(new V(1) == new V(2)); \
                  println(new V(1) != new V(2));";
    assert_eq!(run(source), "true\nfalse\ntrue\n");
}

#[test]
fn instances_without_def_eq_compare_by_identity() {
    let source = "class C { } var a = new C(); var b = new C(); println(a == b); println(a == a);";
    assert_eq!(run(source), "false\ntrue\n");
}

#[test]
fn interned_strings_are_identical() {
    // Equality on strings is identity equality; two occurrences of the same
    // literal (and an equal concatenation) must intern to one object.
    assert_eq!(run("println(\"ab\" == \"ab\"); println(\"a\"+\"b\" == \"ab\");"), "true\ntrue\n");
}

#[test]
fn static_methods_run_on_the_class() {
    let source = "class M { static fn twice(x) { return x * 2; } } println(M.twice(21));";
    assert_eq!(run(source), "42\n");
}

#[test]
fn builders_always_return_the_instance() {
    let source = "class C { build(){ this.v = 1; } } var c = C(); println(c.v);";
    assert_eq!(run(source), "1\n");
}

#[test]
fn constructing_without_builder_requires_zero_args() {
    let err = run_expecting_runtime_error("class C { } var c = new C(1);");
    assert!(err.contains("Expected 0 args"), "unexpected error: {err}");
}

#[test]
fn arity_mismatch_is_a_runtime_error() {
    let err = run_expecting_runtime_error("fn f(a){ return a; } f(1, 2);");
    assert!(err.contains("Expected 1 arguments, but received 2"), "unexpected error: {err}");
}

#[test]
fn undefined_global_is_a_runtime_error() {
    let err = run_expecting_runtime_error("println(missing);");
    assert!(err.contains("'missing' is undefined"), "unexpected error: {err}");
}

#[test]
fn runtime_errors_carry_a_stack_trace() {
    let err = run_expecting_runtime_error("fn inner(){ return 1 + \"x\"; } fn outer(){ return inner(); } outer();");
    assert!(err.contains("in inner()"), "trace missing inner: {err}");
    assert!(err.contains("in outer()"), "trace missing outer: {err}");
}

#[test]
fn index_out_of_bounds() {
    let err = run_expecting_runtime_error("var xs=[1]; println(xs[3]);");
    assert!(err.contains("out of bounds"), "unexpected error: {err}");
    let err = run_expecting_runtime_error("var xs=[1]; println(xs[0-2]);");
    assert!(err.contains("out of bounds"), "unexpected error: {err}");
}

#[test]
fn negative_indexes_wrap() {
    assert_eq!(run("var xs=[1,2,3]; println(xs[0-1]);"), "3\n");
}

#[test]
fn call_frame_overflow_is_reported() {
    let err = run_expecting_runtime_error("fn f(){ return f(); } f();");
    assert!(err.contains("overflow"), "unexpected error: {err}");
}

#[test]
fn compile_error_surfaces_with_location() {
    let err = run_expecting_compile_error("var = 1;");
    assert!(err.contains("[line 1]"), "unexpected error: {err}");
}

#[test]
fn math_library() {
    let source = "import math; println(math.pow(2, 10)); println(math.floor(2.7)); println(math.mod(7, 4));";
    assert_eq!(run(source), "1024\n2\n3\n");
}

#[test]
fn unpack_splices_publics_into_globals() {
    let source = "unpack import math; println(pow(3, 2));";
    assert_eq!(run(source), "9\n");
}

#[test]
fn reimport_is_idempotent() {
    let source = "import math; import math; println(math.ceil(0.2));";
    assert_eq!(run(source), "1\n");
}

#[test]
fn importing_an_unknown_library_fails() {
    let err = run_expecting_runtime_error("import nosuchlib;");
    assert!(err.contains("Undefined library"), "unexpected error: {err}");
}

#[test]
fn vector_library() {
    let source = "import npvec; \
                  var v = npvec.vec(1, 2); \
                  npvec.append(v, 3); \
                  npvec.insert(v, 0, 0); \
                  println(npvec.size(v)); \
                  println(npvec.at(v, 0)); \
                  println(npvec.remove(v, 1)); \
                  println(npvec.pop(v)); \
                  println(npvec.size(v));";
    assert_eq!(run(source), "4\n0\n1\n3\n2\n");
}

#[test]
fn map_library() {
    let source = "import npmap; \
                  var m = npmap.map(\"a\", 1, \"b\", 2); \
                  npmap.put(m, \"c\", 3); \
                  println(npmap.get(m, \"b\")); \
                  println(npmap.has(m, \"c\")); \
                  println(npmap.emplace(m, \"a\", 9)); \
                  println(npmap.get(m, \"a\")); \
                  npmap.remove(m, \"a\"); \
                  println(npmap.has(m, \"a\")); \
                  println(length(npmap.keys(m)));";
    assert_eq!(run(source), "2\ntrue\nfalse\n1\nfalse\n2\n");
}

#[test]
fn map_keys_use_def_hash() {
    let source = "import npmap; \
                  class K { build(n){ this.n = n; } def hash(){ return this.n; } } \
                  var m = npmap.map(); \
                  npmap.put(m, new K(5), \"five\"); \
                  println(npmap.get(m, new K(5)));";
    assert_eq!(run(source), "five\n");
}

#[test]
fn std_list_helpers() {
    let source = "var xs = [1, 2]; \
                  println(append(xs, 3)); \
                  println(pop(xs)); \
                  println(remove(xs, 0)); \
                  println(length(xs)); \
                  println(xs[0]);";
    assert_eq!(run(source), "3\n3\n1\n1\n2\n");
}

#[test]
fn as_string_and_length() {
    assert_eq!(run("println(asString(1.5) + \"!\"); println(length(\"abcd\"));"), "1.5!\n4\n");
}

#[test]
fn value_printing_forms() {
    assert_eq!(run("fn f(){} println(f);"), "<func f>\n");
    assert_eq!(run("class C {} println(C);"), "<class C>\n");
    assert_eq!(run("println(clock() >= 0);"), "true\n");
    let out = run("class C {} println(new C());");
    assert!(out.contains("C>"), "unexpected instance rendering: {out}");
    let out = run("import std; println(std);");
    assert_eq!(out, "<namespace 'std'>\n");
}

#[test]
fn methods_bind_their_receiver() {
    let source = "class A { build(x){ this.x = x; } fn get(){ return this.x; } } \
                  var a = new A(9); \
                  var m = a.get; \
                  println(m());";
    assert_eq!(run(source), "9\n");
}

#[test]
fn for_loop_scoping_keeps_increment_in_scope() {
    // The increment runs after the body in the loop's own scope; body-local
    // declarations do not leak into it.
    let source = "var total = 0; \
                  for (var i = 0; i < 3; i = i + 1) { var double = i * 2; total += double; } \
                  println(total);";
    assert_eq!(run(source), "6\n");
}

#[test]
fn deep_expression_nesting() {
    assert_eq!(run("println((((1 + 2) * (3 + 4)) - 1) / 2);"), "10\n");
}

#[test]
fn file_imports_run_once_and_cache_their_namespace() {
    use std::{env, fs};

    let path = env::temp_dir().join(format!("npz_mod_{}.npb", std::process::id()));
    let path_str = path.to_str().expect("temp path is not UTF-8").to_owned();
    {
        let mut writer = CollectStringPrint::new();
        let mut vm = Vm::new(&mut writer);
        let module = vm
            .compile_source(
                "fn answer() { return 42; } var version = 3; println(\"loaded\");",
                Some(&path_str),
            )
            .expect("module compile failed");
        fs::write(&path, vm.dump_function(module)).expect("module write failed");
    }

    let source = format!(
        "var m = import \"{p}\"; println(m.answer()); println(m.version); \
         var again = import \"{p}\"; println(m == again);",
        p = path_str
    );
    // The module body runs exactly once; the second import hits the cache.
    assert_eq!(run(&source), "loaded\n42\n3\ntrue\n");
    let _ = fs::remove_file(&path);
}

#[test]
fn file_library_round_trips_text() {
    use std::{env, fs};

    let path = env::temp_dir().join(format!("npz_file_{}.txt", std::process::id()));
    let p = path.to_str().expect("temp path is not UTF-8");
    let source = format!(
        "import iofile; \
         var f = iofile.openFile(\"{p}\", \"w\"); \
         iofile.writeFile(f, \"hello\"); \
         iofile.closeFile(f); \
         var g = iofile.openFile(\"{p}\", \"r\"); \
         println(iofile.readFile(g)); \
         println(iofile.fileLength(g)); \
         println(iofile.closeFile(g)); \
         println(iofile.closeFile(g));"
    );
    assert_eq!(run(&source), "hello\n5\ntrue\nfalse\n");
    let _ = fs::remove_file(&path);
}

#[test]
fn negation_and_not() {
    assert_eq!(run("println(-(3+4)); println(!true); println(!null); println(!0);"), "-7\ntrue\ntrue\nfalse\n");
}
