//! The dump/load round trip must be the identity on observable behavior:
//! running a loaded dump prints exactly what running the compiled function
//! prints, and re-dumping a loaded function reproduces the bytes.

use npz::{CollectStringPrint, Vm};

/// Compiles and runs directly.
fn run_direct(source: &str) -> String {
    let mut writer = CollectStringPrint::new();
    {
        let mut vm = Vm::new(&mut writer);
        vm.interpret(source, Some("prog")).expect("direct run failed");
    }
    writer.into_output()
}

/// Compiles in one VM, dumps, loads into a fresh VM, and runs there.
fn run_via_dump(source: &str) -> (String, Vec<u8>, Vec<u8>) {
    let bytes = {
        let mut writer = CollectStringPrint::new();
        let mut vm = Vm::new(&mut writer);
        let function = vm.compile_source(source, Some("prog")).expect("compile failed");
        vm.dump_function(function)
    };

    let mut writer = CollectStringPrint::new();
    let redumped;
    {
        let mut vm = Vm::new(&mut writer);
        let function = vm.load_function(&bytes).expect("load failed");
        redumped = vm.dump_function(function);
        vm.run_function(function).expect("loaded run failed");
    }
    (writer.into_output(), bytes, redumped)
}

fn assert_round_trip(source: &str) {
    let direct = run_direct(source);
    let (loaded, dumped, redumped) = run_via_dump(source);
    assert_eq!(direct, loaded, "output diverged after dump/load");
    assert_eq!(dumped, redumped, "dump is not bit-stable across a load");
}

#[test]
fn arithmetic_round_trips() {
    assert_round_trip("println(1+2*3);");
}

#[test]
fn loops_and_strings_round_trip() {
    assert_round_trip("var s=\"a\"; for(var i=0;i<3;i=i+1) s=s+\"b\"; println(s);");
}

#[test]
fn closures_round_trip() {
    assert_round_trip(
        "fn makeCounter(){var n=0; fn inc(){n=n+1; return n;} return inc;} \
         const c=makeCounter(); println(c()); println(c()); println(c());",
    );
}

#[test]
fn classes_round_trip() {
    assert_round_trip(
        "class A { build(x){ this.x=x; } fn get(){ return this.x; } } \
         class B <- A { fn get(){ return super.get()+1; } } \
         println((new B(41)).get());",
    );
}

#[test]
fn attributes_and_defaults_round_trip() {
    assert_round_trip(
        "class P { var tag = \"p\"; build(x){ this.x=x; } def string(){ return this.tag + asString(this.x); } } \
         println(new P(3));",
    );
}

#[test]
fn libraries_round_trip() {
    assert_round_trip("import math; println(math.pow(2, 8));");
}

#[test]
fn many_constants_use_the_long_form() {
    // Force the constant pool past the one-byte index range so the
    // ConstantLong encoding goes through the container too. Name constants
    // are const8-addressed, so every name is referenced before the number
    // flood claims the low indexes.
    let mut source = String::from("var total = 0;\nprintln(total);\n");
    for i in 0..300 {
        source.push_str(&format!("total = total + {}.5;\n", i * 7));
    }
    source.push_str("println(total > 0);\n");
    assert_round_trip(&source);
}

#[test]
fn loading_garbage_fails_cleanly() {
    let mut writer = CollectStringPrint::new();
    let mut vm = Vm::new(&mut writer);
    assert!(vm.load_function(&[]).is_err());
    assert!(vm.load_function(&[0xff, 0x00, 0x01]).is_err());
    // A truncated but well-tagged prefix must also fail.
    let bytes = {
        let function = vm.compile_source("println(1);", None).expect("compile failed");
        vm.dump_function(function)
    };
    assert!(vm.load_function(&bytes[..bytes.len() - 3]).is_err());
}
