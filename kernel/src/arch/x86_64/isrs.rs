//! Interrupt Service Routine stubs: one per vector, normalizing the CPU-pushed frame so the
//! dispatcher always sees {vector, error_code, gprs..., rip, cs, rflags}.

use core::arch::global_asm;

/// Vectors for which the CPU itself pushes an error code (Intel SDM Vol. 3, table 6-1).
pub const ERROR_CODE_VECTORS: [u8; 10] = [8, 10, 11, 12, 13, 14, 17, 21, 29, 30];

/// The normalized interrupt frame handed to `isr_dispatch`. Field order mirrors push order in
/// `common_trailer`, read from the top of the stack downward (lowest address first).
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct InterruptFrame {
    pub r8: u64,
    pub r9: u64,
    pub r10: u64,
    pub r11: u64,
    pub r12: u64,
    pub r13: u64,
    pub r14: u64,
    pub r15: u64,
    pub rdi: u64,
    pub rsi: u64,
    pub rbp: u64,
    /// Architectural RSP value sampled at push time; informational only, never restored.
    pub rsp: u64,
    pub rbx: u64,
    pub rdx: u64,
    pub rcx: u64,
    pub rax: u64,
    pub error_code: u64,
    pub vector: u64,
    pub rip: u64,
    pub cs: u64,
    pub rflags: u64,
}

global_asm! {
    r#"
    .section .text

    .macro define_stub vec, has_err
    .global stub_vec_\vec
    stub_vec_\vec:
        cli
        .if \has_err == 0
        push 0
        .endif
        push \vec
        jmp common_trailer
    .endm

    define_stub 0, 0
    define_stub 1, 0
    define_stub 2, 0
    define_stub 3, 0
    define_stub 4, 0
    define_stub 5, 0
    define_stub 6, 0
    define_stub 7, 0
    define_stub 8, 1
    define_stub 9, 0
    define_stub 10, 1
    define_stub 11, 1
    define_stub 12, 1
    define_stub 13, 1
    define_stub 14, 1
    define_stub 15, 0
    define_stub 16, 0
    define_stub 17, 1
    define_stub 18, 0
    define_stub 19, 0
    define_stub 20, 0
    define_stub 21, 1
    define_stub 22, 0
    define_stub 23, 0
    define_stub 24, 0
    define_stub 25, 0
    define_stub 26, 0
    define_stub 27, 0
    define_stub 28, 0
    define_stub 29, 1
    define_stub 30, 1
    define_stub 31, 0
    define_stub 32, 0
    define_stub 33, 0
    define_stub 34, 0
    define_stub 35, 0
    define_stub 36, 0
    define_stub 37, 0
    define_stub 38, 0
    define_stub 39, 0
    define_stub 40, 0
    define_stub 41, 0
    define_stub 42, 0
    define_stub 43, 0
    define_stub 44, 0
    define_stub 45, 0
    define_stub 46, 0
    define_stub 47, 0
    define_stub 48, 0
    define_stub 49, 0
    define_stub 50, 0
    define_stub 51, 0
    define_stub 52, 0
    define_stub 53, 0
    define_stub 54, 0
    define_stub 55, 0
    define_stub 56, 0
    define_stub 57, 0
    define_stub 58, 0
    define_stub 59, 0
    define_stub 60, 0
    define_stub 61, 0
    define_stub 62, 0
    define_stub 63, 0
    define_stub 64, 0
    define_stub 65, 0
    define_stub 66, 0
    define_stub 67, 0
    define_stub 68, 0
    define_stub 69, 0
    define_stub 70, 0
    define_stub 71, 0
    define_stub 72, 0
    define_stub 73, 0
    define_stub 74, 0
    define_stub 75, 0
    define_stub 76, 0
    define_stub 77, 0
    define_stub 78, 0
    define_stub 79, 0
    define_stub 80, 0
    define_stub 81, 0
    define_stub 82, 0
    define_stub 83, 0
    define_stub 84, 0
    define_stub 85, 0
    define_stub 86, 0
    define_stub 87, 0
    define_stub 88, 0
    define_stub 89, 0
    define_stub 90, 0
    define_stub 91, 0
    define_stub 92, 0
    define_stub 93, 0
    define_stub 94, 0
    define_stub 95, 0
    define_stub 96, 0
    define_stub 97, 0
    define_stub 98, 0
    define_stub 99, 0
    define_stub 100, 0
    define_stub 101, 0
    define_stub 102, 0
    define_stub 103, 0
    define_stub 104, 0
    define_stub 105, 0
    define_stub 106, 0
    define_stub 107, 0
    define_stub 108, 0
    define_stub 109, 0
    define_stub 110, 0
    define_stub 111, 0
    define_stub 112, 0
    define_stub 113, 0
    define_stub 114, 0
    define_stub 115, 0
    define_stub 116, 0
    define_stub 117, 0
    define_stub 118, 0
    define_stub 119, 0
    define_stub 120, 0
    define_stub 121, 0
    define_stub 122, 0
    define_stub 123, 0
    define_stub 124, 0
    define_stub 125, 0
    define_stub 126, 0
    define_stub 127, 0
    define_stub 128, 0
    define_stub 129, 0
    define_stub 130, 0
    define_stub 131, 0
    define_stub 132, 0
    define_stub 133, 0
    define_stub 134, 0
    define_stub 135, 0
    define_stub 136, 0
    define_stub 137, 0
    define_stub 138, 0
    define_stub 139, 0
    define_stub 140, 0
    define_stub 141, 0
    define_stub 142, 0
    define_stub 143, 0
    define_stub 144, 0
    define_stub 145, 0
    define_stub 146, 0
    define_stub 147, 0
    define_stub 148, 0
    define_stub 149, 0
    define_stub 150, 0
    define_stub 151, 0
    define_stub 152, 0
    define_stub 153, 0
    define_stub 154, 0
    define_stub 155, 0
    define_stub 156, 0
    define_stub 157, 0
    define_stub 158, 0
    define_stub 159, 0
    define_stub 160, 0
    define_stub 161, 0
    define_stub 162, 0
    define_stub 163, 0
    define_stub 164, 0
    define_stub 165, 0
    define_stub 166, 0
    define_stub 167, 0
    define_stub 168, 0
    define_stub 169, 0
    define_stub 170, 0
    define_stub 171, 0
    define_stub 172, 0
    define_stub 173, 0
    define_stub 174, 0
    define_stub 175, 0
    define_stub 176, 0
    define_stub 177, 0
    define_stub 178, 0
    define_stub 179, 0
    define_stub 180, 0
    define_stub 181, 0
    define_stub 182, 0
    define_stub 183, 0
    define_stub 184, 0
    define_stub 185, 0
    define_stub 186, 0
    define_stub 187, 0
    define_stub 188, 0
    define_stub 189, 0
    define_stub 190, 0
    define_stub 191, 0
    define_stub 192, 0
    define_stub 193, 0
    define_stub 194, 0
    define_stub 195, 0
    define_stub 196, 0
    define_stub 197, 0
    define_stub 198, 0
    define_stub 199, 0
    define_stub 200, 0
    define_stub 201, 0
    define_stub 202, 0
    define_stub 203, 0
    define_stub 204, 0
    define_stub 205, 0
    define_stub 206, 0
    define_stub 207, 0
    define_stub 208, 0
    define_stub 209, 0
    define_stub 210, 0
    define_stub 211, 0
    define_stub 212, 0
    define_stub 213, 0
    define_stub 214, 0
    define_stub 215, 0
    define_stub 216, 0
    define_stub 217, 0
    define_stub 218, 0
    define_stub 219, 0
    define_stub 220, 0
    define_stub 221, 0
    define_stub 222, 0
    define_stub 223, 0
    define_stub 224, 0
    define_stub 225, 0
    define_stub 226, 0
    define_stub 227, 0
    define_stub 228, 0
    define_stub 229, 0
    define_stub 230, 0
    define_stub 231, 0
    define_stub 232, 0
    define_stub 233, 0
    define_stub 234, 0
    define_stub 235, 0
    define_stub 236, 0
    define_stub 237, 0
    define_stub 238, 0
    define_stub 239, 0
    define_stub 240, 0
    define_stub 241, 0
    define_stub 242, 0
    define_stub 243, 0
    define_stub 244, 0
    define_stub 245, 0
    define_stub 246, 0
    define_stub 247, 0
    define_stub 248, 0
    define_stub 249, 0
    define_stub 250, 0
    define_stub 251, 0
    define_stub 252, 0
    define_stub 253, 0
    define_stub 254, 0
    define_stub 255, 0
    common_trailer:
        push rax
        push rcx
        push rdx
        push rbx
        push rsp
        push rbp
        push rsi
        push rdi
        push r15
        push r14
        push r13
        push r12
        push r11
        push r10
        push r9
        push r8
        mov rdi, rsp
        call isr_dispatch
        pop r8
        pop r9
        pop r10
        pop r11
        pop r12
        pop r13
        pop r14
        pop r15
        pop rdi
        pop rsi
        pop rbp
        add rsp, 8
        pop rbx
        pop rdx
        pop rcx
        pop rax
        add rsp, 16
        iretq
    "#
}


unsafe extern "C" {
    pub(crate) fn stub_vec_0();
    pub(crate) fn stub_vec_1();
    pub(crate) fn stub_vec_2();
    pub(crate) fn stub_vec_3();
    pub(crate) fn stub_vec_4();
    pub(crate) fn stub_vec_5();
    pub(crate) fn stub_vec_6();
    pub(crate) fn stub_vec_7();
    pub(crate) fn stub_vec_8();
    pub(crate) fn stub_vec_9();
    pub(crate) fn stub_vec_10();
    pub(crate) fn stub_vec_11();
    pub(crate) fn stub_vec_12();
    pub(crate) fn stub_vec_13();
    pub(crate) fn stub_vec_14();
    pub(crate) fn stub_vec_15();
    pub(crate) fn stub_vec_16();
    pub(crate) fn stub_vec_17();
    pub(crate) fn stub_vec_18();
    pub(crate) fn stub_vec_19();
    pub(crate) fn stub_vec_20();
    pub(crate) fn stub_vec_21();
    pub(crate) fn stub_vec_22();
    pub(crate) fn stub_vec_23();
    pub(crate) fn stub_vec_24();
    pub(crate) fn stub_vec_25();
    pub(crate) fn stub_vec_26();
    pub(crate) fn stub_vec_27();
    pub(crate) fn stub_vec_28();
    pub(crate) fn stub_vec_29();
    pub(crate) fn stub_vec_30();
    pub(crate) fn stub_vec_31();
    pub(crate) fn stub_vec_32();
    pub(crate) fn stub_vec_33();
    pub(crate) fn stub_vec_34();
    pub(crate) fn stub_vec_35();
    pub(crate) fn stub_vec_36();
    pub(crate) fn stub_vec_37();
    pub(crate) fn stub_vec_38();
    pub(crate) fn stub_vec_39();
    pub(crate) fn stub_vec_40();
    pub(crate) fn stub_vec_41();
    pub(crate) fn stub_vec_42();
    pub(crate) fn stub_vec_43();
    pub(crate) fn stub_vec_44();
    pub(crate) fn stub_vec_45();
    pub(crate) fn stub_vec_46();
    pub(crate) fn stub_vec_47();
    pub(crate) fn stub_vec_48();
    pub(crate) fn stub_vec_49();
    pub(crate) fn stub_vec_50();
    pub(crate) fn stub_vec_51();
    pub(crate) fn stub_vec_52();
    pub(crate) fn stub_vec_53();
    pub(crate) fn stub_vec_54();
    pub(crate) fn stub_vec_55();
    pub(crate) fn stub_vec_56();
    pub(crate) fn stub_vec_57();
    pub(crate) fn stub_vec_58();
    pub(crate) fn stub_vec_59();
    pub(crate) fn stub_vec_60();
    pub(crate) fn stub_vec_61();
    pub(crate) fn stub_vec_62();
    pub(crate) fn stub_vec_63();
    pub(crate) fn stub_vec_64();
    pub(crate) fn stub_vec_65();
    pub(crate) fn stub_vec_66();
    pub(crate) fn stub_vec_67();
    pub(crate) fn stub_vec_68();
    pub(crate) fn stub_vec_69();
    pub(crate) fn stub_vec_70();
    pub(crate) fn stub_vec_71();
    pub(crate) fn stub_vec_72();
    pub(crate) fn stub_vec_73();
    pub(crate) fn stub_vec_74();
    pub(crate) fn stub_vec_75();
    pub(crate) fn stub_vec_76();
    pub(crate) fn stub_vec_77();
    pub(crate) fn stub_vec_78();
    pub(crate) fn stub_vec_79();
    pub(crate) fn stub_vec_80();
    pub(crate) fn stub_vec_81();
    pub(crate) fn stub_vec_82();
    pub(crate) fn stub_vec_83();
    pub(crate) fn stub_vec_84();
    pub(crate) fn stub_vec_85();
    pub(crate) fn stub_vec_86();
    pub(crate) fn stub_vec_87();
    pub(crate) fn stub_vec_88();
    pub(crate) fn stub_vec_89();
    pub(crate) fn stub_vec_90();
    pub(crate) fn stub_vec_91();
    pub(crate) fn stub_vec_92();
    pub(crate) fn stub_vec_93();
    pub(crate) fn stub_vec_94();
    pub(crate) fn stub_vec_95();
    pub(crate) fn stub_vec_96();
    pub(crate) fn stub_vec_97();
    pub(crate) fn stub_vec_98();
    pub(crate) fn stub_vec_99();
    pub(crate) fn stub_vec_100();
    pub(crate) fn stub_vec_101();
    pub(crate) fn stub_vec_102();
    pub(crate) fn stub_vec_103();
    pub(crate) fn stub_vec_104();
    pub(crate) fn stub_vec_105();
    pub(crate) fn stub_vec_106();
    pub(crate) fn stub_vec_107();
    pub(crate) fn stub_vec_108();
    pub(crate) fn stub_vec_109();
    pub(crate) fn stub_vec_110();
    pub(crate) fn stub_vec_111();
    pub(crate) fn stub_vec_112();
    pub(crate) fn stub_vec_113();
    pub(crate) fn stub_vec_114();
    pub(crate) fn stub_vec_115();
    pub(crate) fn stub_vec_116();
    pub(crate) fn stub_vec_117();
    pub(crate) fn stub_vec_118();
    pub(crate) fn stub_vec_119();
    pub(crate) fn stub_vec_120();
    pub(crate) fn stub_vec_121();
    pub(crate) fn stub_vec_122();
    pub(crate) fn stub_vec_123();
    pub(crate) fn stub_vec_124();
    pub(crate) fn stub_vec_125();
    pub(crate) fn stub_vec_126();
    pub(crate) fn stub_vec_127();
    pub(crate) fn stub_vec_128();
    pub(crate) fn stub_vec_129();
    pub(crate) fn stub_vec_130();
    pub(crate) fn stub_vec_131();
    pub(crate) fn stub_vec_132();
    pub(crate) fn stub_vec_133();
    pub(crate) fn stub_vec_134();
    pub(crate) fn stub_vec_135();
    pub(crate) fn stub_vec_136();
    pub(crate) fn stub_vec_137();
    pub(crate) fn stub_vec_138();
    pub(crate) fn stub_vec_139();
    pub(crate) fn stub_vec_140();
    pub(crate) fn stub_vec_141();
    pub(crate) fn stub_vec_142();
    pub(crate) fn stub_vec_143();
    pub(crate) fn stub_vec_144();
    pub(crate) fn stub_vec_145();
    pub(crate) fn stub_vec_146();
    pub(crate) fn stub_vec_147();
    pub(crate) fn stub_vec_148();
    pub(crate) fn stub_vec_149();
    pub(crate) fn stub_vec_150();
    pub(crate) fn stub_vec_151();
    pub(crate) fn stub_vec_152();
    pub(crate) fn stub_vec_153();
    pub(crate) fn stub_vec_154();
    pub(crate) fn stub_vec_155();
    pub(crate) fn stub_vec_156();
    pub(crate) fn stub_vec_157();
    pub(crate) fn stub_vec_158();
    pub(crate) fn stub_vec_159();
    pub(crate) fn stub_vec_160();
    pub(crate) fn stub_vec_161();
    pub(crate) fn stub_vec_162();
    pub(crate) fn stub_vec_163();
    pub(crate) fn stub_vec_164();
    pub(crate) fn stub_vec_165();
    pub(crate) fn stub_vec_166();
    pub(crate) fn stub_vec_167();
    pub(crate) fn stub_vec_168();
    pub(crate) fn stub_vec_169();
    pub(crate) fn stub_vec_170();
    pub(crate) fn stub_vec_171();
    pub(crate) fn stub_vec_172();
    pub(crate) fn stub_vec_173();
    pub(crate) fn stub_vec_174();
    pub(crate) fn stub_vec_175();
    pub(crate) fn stub_vec_176();
    pub(crate) fn stub_vec_177();
    pub(crate) fn stub_vec_178();
    pub(crate) fn stub_vec_179();
    pub(crate) fn stub_vec_180();
    pub(crate) fn stub_vec_181();
    pub(crate) fn stub_vec_182();
    pub(crate) fn stub_vec_183();
    pub(crate) fn stub_vec_184();
    pub(crate) fn stub_vec_185();
    pub(crate) fn stub_vec_186();
    pub(crate) fn stub_vec_187();
    pub(crate) fn stub_vec_188();
    pub(crate) fn stub_vec_189();
    pub(crate) fn stub_vec_190();
    pub(crate) fn stub_vec_191();
    pub(crate) fn stub_vec_192();
    pub(crate) fn stub_vec_193();
    pub(crate) fn stub_vec_194();
    pub(crate) fn stub_vec_195();
    pub(crate) fn stub_vec_196();
    pub(crate) fn stub_vec_197();
    pub(crate) fn stub_vec_198();
    pub(crate) fn stub_vec_199();
    pub(crate) fn stub_vec_200();
    pub(crate) fn stub_vec_201();
    pub(crate) fn stub_vec_202();
    pub(crate) fn stub_vec_203();
    pub(crate) fn stub_vec_204();
    pub(crate) fn stub_vec_205();
    pub(crate) fn stub_vec_206();
    pub(crate) fn stub_vec_207();
    pub(crate) fn stub_vec_208();
    pub(crate) fn stub_vec_209();
    pub(crate) fn stub_vec_210();
    pub(crate) fn stub_vec_211();
    pub(crate) fn stub_vec_212();
    pub(crate) fn stub_vec_213();
    pub(crate) fn stub_vec_214();
    pub(crate) fn stub_vec_215();
    pub(crate) fn stub_vec_216();
    pub(crate) fn stub_vec_217();
    pub(crate) fn stub_vec_218();
    pub(crate) fn stub_vec_219();
    pub(crate) fn stub_vec_220();
    pub(crate) fn stub_vec_221();
    pub(crate) fn stub_vec_222();
    pub(crate) fn stub_vec_223();
    pub(crate) fn stub_vec_224();
    pub(crate) fn stub_vec_225();
    pub(crate) fn stub_vec_226();
    pub(crate) fn stub_vec_227();
    pub(crate) fn stub_vec_228();
    pub(crate) fn stub_vec_229();
    pub(crate) fn stub_vec_230();
    pub(crate) fn stub_vec_231();
    pub(crate) fn stub_vec_232();
    pub(crate) fn stub_vec_233();
    pub(crate) fn stub_vec_234();
    pub(crate) fn stub_vec_235();
    pub(crate) fn stub_vec_236();
    pub(crate) fn stub_vec_237();
    pub(crate) fn stub_vec_238();
    pub(crate) fn stub_vec_239();
    pub(crate) fn stub_vec_240();
    pub(crate) fn stub_vec_241();
    pub(crate) fn stub_vec_242();
    pub(crate) fn stub_vec_243();
    pub(crate) fn stub_vec_244();
    pub(crate) fn stub_vec_245();
    pub(crate) fn stub_vec_246();
    pub(crate) fn stub_vec_247();
    pub(crate) fn stub_vec_248();
    pub(crate) fn stub_vec_249();
    pub(crate) fn stub_vec_250();
    pub(crate) fn stub_vec_251();
    pub(crate) fn stub_vec_252();
    pub(crate) fn stub_vec_253();
    pub(crate) fn stub_vec_254();
    pub(crate) fn stub_vec_255();
}

pub type HandlerFn = fn(&mut InterruptFrame);

const DEFAULT_HANDLERS: [Option<HandlerFn>; 256] = [None; 256];

static mut HANDLERS: [Option<HandlerFn>; 256] = DEFAULT_HANDLERS;

/// Install a per-vector handler. Passing `None` restores the default panic-logger.
///
/// # Safety
/// Must not race a concurrent interrupt on the same vector; this kernel is single-CPU and runs
/// this only while interrupts are disabled.
pub unsafe fn register_handler(vector: u8, handler: Option<HandlerFn>) {
    #[allow(static_mut_refs)]
    unsafe {
        HANDLERS[vector as usize] = handler;
    }
}

#[unsafe(no_mangle)]
extern "C" fn isr_dispatch(frame: &mut InterruptFrame) {
    let vector = frame.vector as u8;

    #[allow(static_mut_refs)]
    let handler = unsafe { HANDLERS[vector as usize] };

    match handler {
        Some(f) => f(frame),
        None => default_handler(frame),
    }
}

fn default_handler(frame: &InterruptFrame) {
    logger::log_err!(
        "unhandled interrupt: vector={} error_code={:#x} rip={:#x} cs={:#x} rflags={:#x}",
        frame.vector,
        frame.error_code,
        frame.rip,
        frame.cs,
        frame.rflags
    );
    logger::log_err!(
        "rax={:#x} rbx={:#x} rcx={:#x} rdx={:#x} rsi={:#x} rdi={:#x} rbp={:#x}",
        frame.rax, frame.rbx, frame.rcx, frame.rdx, frame.rsi, frame.rdi, frame.rbp
    );
    logger::log_err!(
        "r8={:#x} r9={:#x} r10={:#x} r11={:#x} r12={:#x} r13={:#x} r14={:#x} r15={:#x}",
        frame.r8, frame.r9, frame.r10, frame.r11, frame.r12, frame.r13, frame.r14, frame.r15
    );

    super::hcf();
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::mem::offset_of;

    #[macros::test_fn]
    fn test_interrupt_frame_layout() {
        assert_eq!(offset_of!(InterruptFrame, r8), 0);
        assert_eq!(offset_of!(InterruptFrame, rax), 120);
        assert_eq!(offset_of!(InterruptFrame, error_code), 128);
        assert_eq!(offset_of!(InterruptFrame, vector), 136);
        assert_eq!(offset_of!(InterruptFrame, rip), 144);
    }

    #[macros::test_fn]
    fn test_error_code_vectors_cover_spec_set() {
        for v in ERROR_CODE_VECTORS {
            assert!([8u8, 10, 11, 12, 13, 14, 17, 21, 29, 30].contains(&v));
        }
        assert_eq!(ERROR_CODE_VECTORS.len(), 10);
    }
}
