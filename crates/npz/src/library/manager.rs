use crate::{library::file_lib, library::map_lib, library::math_lib, library::std_lib, library::vec_lib, vm::Vm};

/// Registers every built-in library and the core globals.
pub(crate) fn define_all_libraries(vm: &mut Vm<'_>) {
    vm.define_library("std", std_lib::import);
    vm.define_library("iofile", file_lib::import);
    vm.define_library("npvec", vec_lib::import);
    vm.define_library("npmap", map_lib::import);
    vm.define_library("math", math_lib::import);

    // The core of `std` is also available without an import.
    std_lib::define_core_globals(vm);
}
