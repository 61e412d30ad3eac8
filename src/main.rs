fn main() {
    ledfx_lib::run()
}
